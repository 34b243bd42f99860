//! Facility-level air pollution exposure: dispersion and kernel models run per
//! facility (or per chunk of a facility's stacks), cached on disk, and summed
//! into emission-weighted exposure panels.
pub mod aermod;
pub mod aggregate;
pub mod batch;
pub mod chunks;
pub mod codec;
pub mod combiner;
pub mod config;
pub mod driver;
pub mod env;
pub mod error;
pub mod kernels;
pub mod model;
pub mod panels;
pub mod planner;
pub mod resources;
pub mod store;
pub mod table;

use std::borrow::Cow;

use indicatif::{ProgressBar, ProgressStyle};

pub(crate) fn progress_bar(len: usize, msg: impl Into<Cow<'static, str>>) -> ProgressBar {
    let style = ProgressStyle::with_template(
        "{msg}: {bar:40.cyan/blue} [{human_pos}/{human_len} - {percent}%] (ETA: {eta}, Duration: {elapsed})",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    ProgressBar::new(len as u64)
        .with_style(style)
        .with_message(msg)
}
