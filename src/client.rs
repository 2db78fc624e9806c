//! Kubernetes client construction
//!
//! Configuration precedence: explicit kubeconfig > explicit master URL >
//! in-cluster service account > default loading. No client-side rate
//! limiter is installed: fleet-scale simulation wants full throughput and
//! relies on the server-side admission queue.

use std::path::{Path, PathBuf};

use http::Uri;
use k8s_openapi::api::core::v1::Node;
use kube::api::ListParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use tracing::{info, warn};

use crate::error::Error;
use crate::retry::{retry_with_backoff, RetryConfig};

/// Where the client configuration comes from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientSource {
    /// An explicit kubeconfig file
    Kubeconfig(PathBuf),
    /// An explicit API server address
    Master(String),
    /// The in-cluster service account, falling back to default loading
    InCluster,
}

/// Pick the configuration source for the given flags
pub fn select_source(kubeconfig: Option<&Path>, master: Option<&str>) -> ClientSource {
    if let Some(path) = kubeconfig {
        ClientSource::Kubeconfig(path.to_path_buf())
    } else if let Some(master) = master {
        ClientSource::Master(master.to_string())
    } else {
        ClientSource::InCluster
    }
}

/// Build the client for the selected configuration source.
///
/// # Errors
///
/// Any failure here is startup-fatal; nothing works without a client.
pub async fn build_client(
    kubeconfig: Option<&Path>,
    master: Option<&str>,
) -> Result<Client, Error> {
    let config = match select_source(kubeconfig, master) {
        ClientSource::Kubeconfig(path) => {
            let kubeconfig = Kubeconfig::read_from(&path)
                .map_err(|e| Error::startup(format!("failed to load kubeconfig: {e}")))?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::startup(format!("invalid kubeconfig: {e}")))?
        }
        ClientSource::Master(master) => {
            let uri: Uri = master
                .parse()
                .map_err(|e| Error::startup(format!("invalid master URL {master:?}: {e}")))?;
            Config::new(uri)
        }
        ClientSource::InCluster => match Config::incluster() {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "Not running in-cluster, falling back to default config loading");
                Config::infer()
                    .await
                    .map_err(|e| Error::startup(format!("no usable client configuration: {e}")))?
            }
        },
    };

    Client::try_from(config).map_err(Error::from)
}

/// Boot readiness probe: a one-item node list under the startup backoff
/// ladder. Gates the whole process - if the API server is unreachable,
/// startup fails fast instead of spinning up watches that cannot connect.
///
/// # Errors
///
/// Returns the last list error once the ladder is exhausted.
pub async fn wait_for_api_server(client: &Client) -> Result<(), Error> {
    let nodes: Api<Node> = Api::all(client.clone());
    let params = ListParams::default().limit(1);

    retry_with_backoff(&RetryConfig::startup_probe(), "list_nodes_probe", || {
        let nodes = nodes.clone();
        let params = params.clone();
        async move { nodes.list(&params).await }
    })
    .await
    .map(|_| info!("API server is reachable"))
    .map_err(|e| Error::startup(format!("API server unreachable: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Configuration precedence
    // =========================================================================

    #[test]
    fn test_kubeconfig_wins_over_master() {
        let source = select_source(
            Some(Path::new("/home/user/.kube/config")),
            Some("https://10.0.0.1:6443"),
        );
        assert_eq!(
            source,
            ClientSource::Kubeconfig(PathBuf::from("/home/user/.kube/config"))
        );
    }

    #[test]
    fn test_master_wins_over_in_cluster() {
        let source = select_source(None, Some("https://10.0.0.1:6443"));
        assert_eq!(
            source,
            ClientSource::Master("https://10.0.0.1:6443".to_string())
        );
    }

    #[test]
    fn test_nothing_set_uses_in_cluster() {
        assert_eq!(select_source(None, None), ClientSource::InCluster);
    }
}
