use std::io::IsTerminal;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use stamp_sign_suite::assets::{AssetDiscovery, DirAssetStore};
use stamp_sign_suite::config::SuiteConfig;
use stamp_sign_suite::runner::Progress;
use stamp_sign_suite::signature::TrustPolicy;
use stamp_sign_suite::signer::PdfSigner;
use stamp_sign_suite::viewer::VerifyingViewer;
use stamp_sign_suite::{grid, logging, TestRunner};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::args_os().nth(1) {
        Some(path) => SuiteConfig::load(&path)
            .await
            .with_context(|| format!("loading {}", Path::new(&path).display()))?,
        None => SuiteConfig::from_env()?,
    };
    logging::init_tracing(&config.general)?;

    let store = DirAssetStore::new(&config.assets.base_dir);
    let artifacts = AssetDiscovery::new(&config.assets.extensions, config.assets.recurse)
        .find(&store, &config.assets.folder);
    info!(
        count = artifacts.len(),
        folder = %store.root().join(&config.assets.folder).display(),
        "discovered stamp images"
    );

    let trust = TrustPolicy::from_dir(config.viewer.trusted_ca_dir().as_deref())
        .context("loading trusted CA certificates")?;
    let signer = PdfSigner::from_config(&config);
    let viewer = VerifyingViewer::new(&config.signing.document, trust);

    let handle = TestRunner::new(Arc::new(signer), Arc::new(viewer), config.runner_config())
        .start(artifacts.clone());

    let mut progress = handle.subscribe();
    let mut shown = None;
    loop {
        let snapshot = progress.borrow_and_update().clone();
        // Only redraw when the title or a marker would change.
        let key = (snapshot.cursor, snapshot.results.len());
        if shown != Some(key) {
            draw(&artifacts, &snapshot);
            shown = Some(key);
        }
        if progress.changed().await.is_err() {
            break;
        }
    }

    handle.finished().await?;

    Ok(())
}

fn draw(artifacts: &[String], progress: &Progress) {
    if std::io::stdout().is_terminal() {
        // Clear the screen and home the cursor.
        print!("\x1b[2J\x1b[H");
    }
    print!("{}", grid::render(artifacts, progress));
}
