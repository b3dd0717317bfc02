#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use psp_advisor_core as core;
pub use psp_advisor_k8s_api as k8s;

mod args;
mod output;
pub mod source;

pub use self::{args::Args, output::OutputFormat};
