//! Cluster-provider probes: determine the identity (account, region, name)
//! of the cluster this agent runs in.

use anyhow::Context;
use indexer::ClusterContext;

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum Provider {
    Eks,
    Gke,
    Aks,
    Kind,
}

/// Identity overrides taken from flags. Any field a probe cannot discover
/// must be provided here.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub account: Option<String>,
    pub region: Option<String>,
    pub cluster_name: Option<String>,
    pub autodiscover: bool,
}

/// Probe the cluster identity for the selected provider.
pub async fn probe(provider: Provider, overrides: Overrides) -> anyhow::Result<ClusterContext> {
    match provider {
        Provider::Eks => probe_eks(overrides).await,
        Provider::Gke => from_overrides("gke", overrides),
        Provider::Aks => from_overrides("aks", overrides),
        Provider::Kind => Ok(ClusterContext {
            provider: "kind".to_string(),
            account: overrides.account.unwrap_or_else(|| "kind".to_string()),
            region: overrides.region.unwrap_or_else(|| "local".to_string()),
            cluster_name: overrides.cluster_name.unwrap_or_else(|| "kind".to_string()),
        }),
    }
}

// EKS identity: flags win; the instance metadata service fills what they
// leave open when autodiscovery is on. The cluster name is never
// discoverable from IMDS and must always be flagged.
async fn probe_eks(overrides: Overrides) -> anyhow::Result<ClusterContext> {
    let mut account = overrides.account.unwrap_or_default();
    let mut region = overrides.region.unwrap_or_default();

    if overrides.autodiscover && (account.is_empty() || region.is_empty()) {
        let identity = instance_identity()
            .await
            .context("autodiscovering instance identity from IMDS")?;
        if account.is_empty() {
            account = identity.account_id;
        }
        if region.is_empty() {
            region = identity.region;
        }
    }

    let cluster_name = overrides
        .cluster_name
        .filter(|name| !name.is_empty())
        .context("an EKS cluster name is required")?;
    anyhow::ensure!(!account.is_empty(), "an EKS account id is required");
    anyhow::ensure!(!region.is_empty(), "an EKS region is required");

    Ok(ClusterContext {
        provider: "eks".to_string(),
        account,
        region,
        cluster_name,
    })
}

fn from_overrides(provider: &str, overrides: Overrides) -> anyhow::Result<ClusterContext> {
    let require = |field: Option<String>, what: &str| {
        field
            .filter(|value| !value.is_empty())
            .with_context(|| format!("a {provider} {what} is required"))
    };
    Ok(ClusterContext {
        provider: provider.to_string(),
        account: require(overrides.account, "account")?,
        region: require(overrides.region, "region")?,
        cluster_name: require(overrides.cluster_name, "cluster name")?,
    })
}

const IMDS_BASE: &str = "http://169.254.169.254";

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceIdentity {
    account_id: String,
    region: String,
}

// IMDSv2: fetch a session token, then the instance identity document.
async fn instance_identity() -> anyhow::Result<InstanceIdentity> {
    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(2))
        .build()?;

    let token = http
        .put(format!("{IMDS_BASE}/latest/api/token"))
        .header("X-aws-ec2-metadata-token-ttl-seconds", "21600")
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;

    let identity = http
        .get(format!(
            "{IMDS_BASE}/latest/dynamic/instance-identity/document"
        ))
        .header("X-aws-ec2-metadata-token", token)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    Ok(identity)
}
