//! Lease-based leader election, restricting indexing to one agent replica.

use anyhow::Context as _;
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, PostParams};
use tokio_util::sync::CancellationToken;

const LEASE_DURATION_SECONDS: i32 = 15;
const RENEW_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);
const RETRY_INTERVAL: std::time::Duration = std::time::Duration::from_secs(2);

/// Block until this replica holds the named lease, then keep renewing it
/// in the background. Returns false if cancelled before acquiring.
/// A lease lost later cancels `cancel`, shutting the agent down rather
/// than risking two active indexers.
pub async fn lead(
    client: kube::Client,
    namespace: &str,
    name: &str,
    identity: &str,
    cancel: CancellationToken,
) -> anyhow::Result<bool> {
    let api: Api<Lease> = Api::namespaced(client, namespace);

    loop {
        if cancel.is_cancelled() {
            return Ok(false);
        }
        match try_acquire(&api, name, identity).await {
            Ok(true) => break,
            Ok(false) => {}
            Err(error) => tracing::warn!(%error, "failed to acquire leader lease"),
        }
        tokio::time::sleep(RETRY_INTERVAL).await;
    }
    tracing::info!(%name, %identity, "acquired leader lease");

    let api = api.clone();
    let name = name.to_string();
    let identity = identity.to_string();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(RENEW_INTERVAL) => {}
            }
            match try_acquire(&api, &name, &identity).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::error!(%name, "lost leader lease; shutting down");
                    cancel.cancel();
                    return;
                }
                Err(error) => {
                    // Transient renewal errors are tolerated; the lease
                    // outlives a few missed renewals.
                    tracing::warn!(%error, "failed to renew leader lease");
                }
            }
        }
    });
    Ok(true)
}

// Take or renew the lease if it is unheld, expired, or already ours.
async fn try_acquire(api: &Api<Lease>, name: &str, identity: &str) -> anyhow::Result<bool> {
    let now = MicroTime(Utc::now());

    let Some(mut lease) = api.get_opt(name).await.context("reading lease")? else {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(identity.to_string()),
                lease_duration_seconds: Some(LEASE_DURATION_SECONDS),
                acquire_time: Some(now.clone()),
                renew_time: Some(now),
                ..Default::default()
            }),
        };
        return match api.create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            // Another replica created it first.
            Err(kube::Error::Api(response)) if response.code == 409 => Ok(false),
            Err(error) => Err(error).context("creating lease"),
        };
    };

    let spec = lease.spec.take().unwrap_or_default();
    let held_by_us = spec.holder_identity.as_deref() == Some(identity);
    let expired = match (&spec.holder_identity, &spec.renew_time) {
        (None, _) => true,
        (Some(_), None) => true,
        (Some(_), Some(renewed)) => {
            let duration = spec.lease_duration_seconds.unwrap_or(LEASE_DURATION_SECONDS);
            renewed.0 + chrono::Duration::seconds(duration as i64) < Utc::now()
        }
    };
    if !held_by_us && !expired {
        return Ok(false);
    }

    lease.spec = Some(LeaseSpec {
        holder_identity: Some(identity.to_string()),
        lease_duration_seconds: Some(LEASE_DURATION_SECONDS),
        acquire_time: if held_by_us {
            spec.acquire_time
        } else {
            Some(now.clone())
        },
        renew_time: Some(now),
        lease_transitions: if held_by_us {
            spec.lease_transitions
        } else {
            Some(spec.lease_transitions.unwrap_or_default() + 1)
        },
        ..Default::default()
    });
    match api.replace(name, &PostParams::default(), &lease).await {
        Ok(_) => Ok(true),
        // Lost a conflicting update; the winner holds the lease.
        Err(kube::Error::Api(response)) if response.code == 409 => Ok(false),
        Err(error) => Err(error).context("updating lease"),
    }
}
