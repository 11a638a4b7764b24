#[macro_use]
extern crate tracing;

pub mod auth;
pub mod bus;
pub mod capture;
pub mod cloud;
pub mod config;
pub mod event;
pub mod listener;
pub mod live_view;
pub mod log;
pub mod recording;
pub mod service;
pub mod sleep;
pub mod storage;
pub mod ticket;
pub mod util;
pub mod wake;

pub use service::CaptureService;
