//! Try-on image analysis CLI tool
//!
//! Drives the tryon-vision library from the command line: optimize uploads,
//! remove backgrounds and check foot visibility.

#[cfg(feature = "cli")]
use tryon_vision::cli;

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::main().await
}

#[cfg(not(feature = "cli"))]
fn main() {
    panic!("CLI feature not enabled. Please rebuild with --features cli");
}
