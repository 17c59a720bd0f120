use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tracing::info;

use crate::runner::{SignedDocument, ViewOutcome, Viewer};
use crate::signature::TrustPolicy;
use crate::verify::{verify_from_reference, VerifiedSignature};

/// "Displays" a signed document by loading it and verifying its signature
/// against the unsigned reference it was produced from.
#[derive(Clone)]
pub struct VerifyingViewer {
    reference: PathBuf,
    trust: Arc<TrustPolicy>,
}

impl VerifyingViewer {
    pub fn new(reference: impl Into<PathBuf>, trust: TrustPolicy) -> Self {
        Self {
            reference: reference.into(),
            trust: Arc::new(trust),
        }
    }

    fn load(&self, document: &SignedDocument) -> anyhow::Result<VerifiedSignature> {
        let reference = std::fs::read(&self.reference)
            .with_context(|| format!("reading {}", self.reference.display()))?;
        let signed = std::fs::read(&document.path)
            .with_context(|| format!("reading {}", document.path.display()))?;

        verify_from_reference(reference, signed, &self.trust)?
            .context("document carries no signature")
    }
}

#[async_trait]
impl Viewer for VerifyingViewer {
    async fn display(&self, document: &SignedDocument) -> ViewOutcome {
        let viewer = self.clone();
        let document = document.clone();
        let loaded = tokio::task::spawn_blocking(move || {
            let signature = viewer.load(&document)?;
            let signers = signature
                .signers
                .iter()
                .map(|s| s.name.as_str())
                .collect::<Vec<_>>();
            info!(
                artifact = %document.artifact,
                ?signers,
                annotation = ?signature.annotation,
                "signature verified"
            );
            anyhow::Ok(())
        })
        .await;

        match loaded {
            Ok(Ok(())) => ViewOutcome::Loaded,
            Ok(Err(e)) => ViewOutcome::LoadFailed(e),
            Err(e) => ViewOutcome::LoadFailed(e.into()),
        }
    }
}
