//! Building blocks for [`clap`]-driven configuration of the restore tools.
//!
//! [`clap`]: https://docs.rs/clap/
pub mod split_scatter;
pub mod tokio;
