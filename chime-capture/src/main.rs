#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]

#[macro_use]
extern crate tracing;

use std::process::ExitCode;

use anyhow::Context as _;
use chime_capture::config::ConfHandle;
use chime_capture::service::{CaptureService, CliOverrides, SERVICE_NAME, StopReason};
use chime_capture::sleep::SleepMode;

const EXIT_CODE_INTERRUPTED: u8 = 130;

enum CliAction {
    ShowHelp,
    ShowVersion,
    Run { overrides: CliOverrides },
}

fn main() -> ExitCode {
    match run() {
        Ok(StopReason::Terminated) => ExitCode::SUCCESS,
        Ok(StopReason::Interrupted) => ExitCode::from(EXIT_CODE_INTERRUPTED),
        Err(error) => {
            eprintln!("{SERVICE_NAME}: {error:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> anyhow::Result<StopReason> {
    let action = parse_args().context("invalid command line")?;

    let overrides = match action {
        CliAction::ShowHelp => {
            print_help();
            return Ok(StopReason::Terminated);
        }
        CliAction::ShowVersion => {
            println!("{SERVICE_NAME} {}", env!("CARGO_PKG_VERSION"));
            return Ok(StopReason::Terminated);
        }
        CliAction::Run { overrides } => overrides,
    };

    let conf_handle = ConfHandle::init().context("failed to initialize configuration")?;

    let service = CaptureService::load(&conf_handle, overrides).context("failed to load the service")?;

    let reason = service.run()?;

    if reason == StopReason::Interrupted {
        info!("Shutdown requested by keyboard interrupt");
    }

    Ok(reason)
}

fn parse_args() -> anyhow::Result<CliAction> {
    let mut args = std::env::args().skip(1);
    let mut overrides = CliOverrides::default();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(CliAction::ShowHelp),
            "--version" | "-V" => return Ok(CliAction::ShowVersion),
            "--config-path" => {
                let path = args.next().context("missing value for --config-path")?;
                // SAFETY: parsed before any thread is spawned.
                unsafe {
                    std::env::set_var("CHIME_CAPTURE_CONFIG_PATH", path);
                }
            }
            "--no-sleep-prevention" => {
                overrides.prevent_sleep = Some(false);
            }
            "--sleep-mode" => {
                let mode = args.next().context("missing value for --sleep-mode")?;
                let mode = match mode.as_str() {
                    "all" => SleepMode::All,
                    "system" => SleepMode::System,
                    "disk" => SleepMode::Disk,
                    "none" => {
                        overrides.prevent_sleep = Some(false);
                        SleepMode::None
                    }
                    other => anyhow::bail!("unknown sleep mode: {other}"),
                };
                overrides.sleep_mode = Some(mode);
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }

    Ok(CliAction::Run { overrides })
}

fn print_help() {
    println!(
        "Usage: {SERVICE_NAME} [OPTIONS]

Capture daemon recording live view video for a doorbell/camera fleet.

Options:
  --config-path <PATH>     Directory holding {SERVICE_NAME}.json
  --sleep-mode <MODE>      Sleep prevention mode: all, system, disk, none
                           (default: system)
  --no-sleep-prevention    Disable sleep prevention entirely
  -h, --help               Print help
  -V, --version            Print version"
    );
}
