//! Identity Reconciler: point the restored self-referential endpoint at this host.

use super::RunState;
use crate::config::Config;
use crate::errors::BootstrapError;
use crate::metadata::{HostMetadata, endpoint_for};
use regex::{NoExpand, Regex};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum IdentityOutcome {
    /// Fresh start; nothing recorded to rewrite
    Skipped,
    NoConfigFile,
    /// The metadata interface did not answer
    AddressUnavailable { reason: String },
    /// The config file has no endpoint element
    NoElement,
    Rewritten { previous: String, endpoint: String },
}

pub async fn reconcile(
    config: &Config,
    metadata: &dyn HostMetadata,
    state: &RunState,
) -> Result<IdentityOutcome, BootstrapError> {
    if !state.restore_occurred {
        return Ok(IdentityOutcome::Skipped);
    }
    let path = config.location_config_path();
    if !path.is_file() {
        tracing::info!(file = %path.display(), "No endpoint configuration to reconcile");
        return Ok(IdentityOutcome::NoConfigFile);
    }

    let addr = match metadata.public_address().await {
        Ok(addr) => addr,
        Err(e) => {
            tracing::warn!("Could not resolve this host's public address, leaving endpoint as restored: {:#}", e);
            return Ok(IdentityOutcome::AddressUnavailable {
                reason: format!("{:#}", e),
            });
        }
    };
    let endpoint = endpoint_for(addr, config.container.service_port);

    let io_err = |source| BootstrapError::Io {
        path: path.clone(),
        source,
    };
    let xml = std::fs::read_to_string(&path).map_err(io_err)?;
    let Some((previous, rewritten)) = rewrite_element(&xml, &config.identity.element, &endpoint)
    else {
        tracing::warn!(element = %config.identity.element, "Endpoint element not found in {}", path.display());
        return Ok(IdentityOutcome::NoElement);
    };

    std::fs::write(&path, rewritten).map_err(io_err)?;
    std::os::unix::fs::lchown(
        &path,
        Some(config.host.workload_uid),
        Some(config.host.workload_gid),
    )
    .map_err(io_err)?;
    tracing::info!(previous = %previous, endpoint = %endpoint, "Endpoint reconciled");
    Ok(IdentityOutcome::Rewritten { previous, endpoint })
}

/// Replace the text of the first `<element>` in `xml`.
///
/// Returns the previous text and the rewritten document.
pub fn rewrite_element(xml: &str, element: &str, value: &str) -> Option<(String, String)> {
    let tag = regex::escape(element);
    let re = Regex::new(&format!(r"<{tag}>([^<]*)</{tag}>")).ok()?;
    let previous = re.captures(xml)?.get(1)?.as_str().to_string();
    let replacement = format!("<{element}>{value}</{element}>");
    Some((previous, re.replacen(xml, 1, NoExpand(&replacement)).into_owned()))
}
