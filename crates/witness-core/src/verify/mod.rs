//! Proof bundle verification.
//!
//! A bundle is self-consistent when the firmware digest matches its manifest,
//! the manifest carries exactly the expected signatures, the checkpoint is
//! signed by the log and the manifest is included under that checkpoint.
//! Separately, the bundle's checkpoint must be consistent with the largest
//! checkpoint this machine has seen for the log.

pub mod manifest;

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::bundle::{Component, FirmwareBundle};
use crate::log::note::{NoteError, NoteVerifier, open_note};
use crate::log::{Checkpoint, LogError, LogStateTracker, ProofError, leaf_hash, verify_consistency, verify_inclusion};

pub use manifest::{FirmwareRelease, HabTarget};

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("Firmware digest mismatch: manifest {expected}, firmware {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("Manifest signer mismatch: {0}")]
    SignerMismatch(String),

    #[error("Malformed manifest: {0}")]
    Manifest(String),

    #[error("Manifest is for {actual}, expected {expected}")]
    ComponentMismatch { expected: Component, actual: Component },

    #[error("Invalid checkpoint: {0}")]
    Checkpoint(#[source] LogError),

    #[error("Inclusion proof failed: {0}")]
    InclusionProof(#[source] ProofError),

    #[error("Checkpoint not consistent with log: {0}")]
    Consistency(String),

    #[error("Log error: {0}")]
    Log(#[from] LogError),
}

/// Result of a successful self-consistency check.
#[derive(Debug, Clone)]
pub struct VerifiedRelease {
    pub release: FirmwareRelease,
    pub checkpoint: Checkpoint,
}

/// Verifies bundles of one component.
#[derive(Clone)]
pub struct BundleVerifier {
    component: Component,
    log_origin: String,
    log_verifier: Arc<dyn NoteVerifier>,
    manifest_verifiers: Vec<Arc<dyn NoteVerifier>>,
}

impl BundleVerifier {
    pub fn new(
        component: Component,
        log_origin: &str,
        log_verifier: Arc<dyn NoteVerifier>,
        manifest_verifiers: Vec<Arc<dyn NoteVerifier>>,
    ) -> Self {
        Self {
            component,
            log_origin: log_origin.to_string(),
            log_verifier,
            manifest_verifiers,
        }
    }

    pub fn component(&self) -> Component {
        self.component
    }

    /// Check that `bundle` stands on its own.
    #[instrument(skip(self, bundle), fields(component = %self.component, index = bundle.log_index))]
    pub fn verify_self_consistency(&self, bundle: &FirmwareBundle) -> Result<VerifiedRelease, VerifyError> {
        let note = open_note(&bundle.manifest, &self.manifest_verifiers).map_err(|e| match e {
            NoteError::Malformed(m) => VerifyError::Manifest(m),
            other => VerifyError::SignerMismatch(other.to_string()),
        })?;
        if let Some(extra) = note.unverified.first() {
            return Err(VerifyError::SignerMismatch(format!(
                "unexpected signature from {}",
                extra.name
            )));
        }
        for (i, v) in self.manifest_verifiers.iter().enumerate() {
            let repeated = self.manifest_verifiers[..i]
                .iter()
                .any(|seen| seen.name() == v.name() && seen.key_hash() == v.key_hash());
            if repeated {
                return Err(VerifyError::SignerMismatch(format!(
                    "{} is required more than once",
                    v.name()
                )));
            }
            if !note.signed_by(v.as_ref()) {
                return Err(VerifyError::SignerMismatch(format!(
                    "missing signature from {}",
                    v.name()
                )));
            }
        }

        let release =
            FirmwareRelease::from_json(&note.text).map_err(|e| VerifyError::Manifest(e.to_string()))?;
        if release.component != self.component {
            return Err(VerifyError::ComponentMismatch {
                expected: self.component,
                actual: release.component,
            });
        }

        let digest = bundle.firmware_digest();
        if release.firmware_digest_sha256 != digest {
            return Err(VerifyError::DigestMismatch {
                expected: hex::encode(&release.firmware_digest_sha256),
                actual: hex::encode(digest),
            });
        }

        let checkpoint = Checkpoint::parse(&bundle.checkpoint, &self.log_origin, &self.log_verifier)
            .map_err(VerifyError::Checkpoint)?;
        verify_inclusion(
            bundle.log_index,
            checkpoint.size,
            &leaf_hash(&bundle.manifest),
            &bundle.inclusion_proof,
            &checkpoint.root_hash,
        )
        .map_err(VerifyError::InclusionProof)?;

        debug!(
            tag = %release.git_tag_name,
            size = checkpoint.size,
            "Bundle is self-consistent"
        );
        Ok(VerifiedRelease { release, checkpoint })
    }

    /// Check that the bundle's checkpoint is consistent with the tracker's,
    /// refreshing the tracker first when the bundle is ahead of it.
    #[instrument(skip(self, bundle, tracker), fields(component = %self.component))]
    pub fn verify_against_current_log(
        &self,
        bundle: &FirmwareBundle,
        tracker: &mut LogStateTracker,
    ) -> Result<(), VerifyError> {
        let cp = Checkpoint::parse(&bundle.checkpoint, &self.log_origin, &self.log_verifier)
            .map_err(VerifyError::Checkpoint)?;

        if cp.size > tracker.latest().size {
            debug!(bundle = cp.size, tracked = tracker.latest().size, "Refreshing log tracker");
            tracker.update()?;
        }

        let latest = tracker.latest().clone();
        if cp.size > latest.size {
            return Err(VerifyError::Consistency(format!(
                "bundle checkpoint size {} is ahead of the log at {}",
                cp.size, latest.size
            )));
        }

        let proof = tracker.consistency_proof(cp.size, latest.size)?;
        verify_consistency(cp.size, latest.size, &proof, &cp.root_hash, &latest.root_hash)
            .map_err(|e| VerifyError::Consistency(format!("{} -> {}: {e}", cp.size, latest.size)))?;

        info!(from = cp.size, to = latest.size, "Bundle checkpoint consistent with log");
        Ok(())
    }
}

/// One verifier per component.
#[derive(Clone)]
pub struct VerifierSet {
    pub bootloader: BundleVerifier,
    pub os: BundleVerifier,
    pub applet: BundleVerifier,
    pub recovery: BundleVerifier,
}

impl VerifierSet {
    pub fn get(&self, component: Component) -> &BundleVerifier {
        match component {
            Component::Bootloader => &self.bootloader,
            Component::TrustedOs => &self.os,
            Component::TrustedApplet => &self.applet,
            Component::Recovery => &self.recovery,
        }
    }
}
