use super::{ChartApi, ChartError, ChartMetadata, ChartRelease};
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconciliationDecision {
    NoAction,
    Install,
    UninstallThenInstall,
}

/// Compares what is deployed against what is about to be installed. Helm
/// does not reliably say whether an existing release is usable, so anything
/// other than a deployed release of the exact same chart is replaced.
pub fn decide(
    existing: &Result<Option<ChartRelease>, ChartError>,
    desired: &ChartMetadata,
) -> ReconciliationDecision {
    match existing {
        Ok(None) => ReconciliationDecision::Install,
        Err(err) if err.is_not_found() => ReconciliationDecision::Install,
        Err(err) => {
            debug!(?err, "release lookup failed");
            ReconciliationDecision::UninstallThenInstall
        }
        Ok(Some(release)) if !release.is_deployed() => {
            debug!(status = %release.status, "release is not deployed");
            ReconciliationDecision::UninstallThenInstall
        }
        Ok(Some(release))
            if release.chart_version != desired.version
                || release.app_version != desired.app_version =>
        {
            debug!(
                current = %release.chart_version,
                desired = %desired.version,
                "release chart differs"
            );
            ReconciliationDecision::UninstallThenInstall
        }
        Ok(Some(_)) => ReconciliationDecision::NoAction,
    }
}

/// Looks up `name`, decides, and uninstalls it when it has to be replaced.
/// Installing is left to the caller.
#[tracing::instrument(skip(charts, desired), fields(version = %desired.version))]
pub async fn reconcile(
    charts: &dyn ChartApi,
    namespace: &str,
    name: &str,
    desired: &ChartMetadata,
) -> Result<ReconciliationDecision, ChartError> {
    let existing = charts.get_release(namespace, name).await;
    let decision = decide(&existing, desired);
    match decision {
        ReconciliationDecision::UninstallThenInstall => {
            info!("Removing outdated release {name}");
            match charts.uninstall(namespace, name).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {
                    warn!("Release {name} vanished before it could be removed")
                }
                Err(err) => return Err(err),
            }
        }
        ReconciliationDecision::Install | ReconciliationDecision::NoAction => {
            debug!(?decision, "nothing to clean up");
        }
    }
    Ok(decision)
}
