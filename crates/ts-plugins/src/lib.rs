//! Built-in plugins for the TS pipeline: inputs (`file`, `null`), outputs
//! (`file`, `drop`) and packet processors (`mux`, `scrambler`,
//! `pcrextract`).

pub mod file;
pub mod input;
pub mod mux;
pub mod output;
pub mod pcrextract;
pub mod scrambler;
pub mod service;

pub use file::TsFileReader;
pub use input::{FileInput, NullInput};
pub use mux::{MuxConfig, MuxProcessor};
pub use output::{DropOutput, FileOutput};
pub use pcrextract::{PcrExtract, PcrExtractConfig};
pub use scrambler::{Scrambler, ScramblerConfig, ScramblingMode};
pub use service::{ServiceDiscovery, ServiceRef};
