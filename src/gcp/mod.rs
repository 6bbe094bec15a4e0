// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Google Compute Engine. The vTPM attestation key is vouched for by the
//! Compute API's shielded instance identity.

pub mod es;
pub mod snp;

use crate::document::AttestationDocument;
use crate::error::{Error, Result};
use crate::https::{HttpError, HttpsGetter};
use crate::snp::instance::GceInstanceInfo;
use crate::vtpm::validator::document_ak;
use openssl::pkey::{PKey, Public};
use serde::Deserialize;

pub const METADATA_URL: &str = "http://metadata.google.internal/computeMetadata/v1";
pub const COMPUTE_API_URL: &str = "https://compute.googleapis.com/compute/v1";
const METADATA_HEADER: (&str, &str) = ("Metadata-Flavor", "Google");

fn metadata(getter: &dyn HttpsGetter, path: &str) -> Result<String, HttpError> {
    let body = getter.get(&format!("{METADATA_URL}/{path}"), &[METADATA_HEADER])?;
    Ok(String::from_utf8_lossy(&body).trim().to_string())
}

/// Identity of the instance this process runs on.
pub fn instance_info(getter: &dyn HttpsGetter) -> Result<GceInstanceInfo> {
    let project_id = metadata(getter, "project/project-id")?;
    let instance_name = metadata(getter, "instance/name")?;
    // projects/<number>/zones/<zone>
    let zone = metadata(getter, "instance/zone")?;
    let zone = zone.rsplit('/').next().unwrap_or_default().to_string();
    if project_id.is_empty() || instance_name.is_empty() || zone.is_empty() {
        return Err(Error::Io("incomplete GCE metadata".into()));
    }
    Ok(GceInstanceInfo {
        project_id,
        instance_name,
        zone,
    })
}

#[derive(Deserialize)]
struct AccessToken {
    access_token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShieldedInstanceIdentity {
    signing_key: ShieldedInstanceIdentityEntry,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShieldedInstanceIdentityEntry {
    ek_pub: String,
}

pub(crate) fn identity_url(info: &GceInstanceInfo) -> String {
    format!(
        "{COMPUTE_API_URL}/projects/{}/zones/{}/instances/{}/getShieldedInstanceIdentity",
        info.project_id, info.zone, info.instance_name
    )
}

/// Fetch the signing key GCE reports for the instance and require it to be
/// the document's attestation key.
pub(crate) fn trusted_key(
    getter: &dyn HttpsGetter,
    info: &GceInstanceInfo,
    doc: &AttestationDocument,
) -> Result<PKey<Public>> {
    if info.project_id.is_empty() || info.instance_name.is_empty() || info.zone.is_empty() {
        return Err(Error::MalformedDocument("incomplete GCE instance info".into()));
    }
    let token = getter.get(
        &format!("{METADATA_URL}/instance/service-accounts/default/token"),
        &[METADATA_HEADER],
    )?;
    let token: AccessToken =
        serde_json::from_slice(&token).map_err(|e| Error::Transient(format!("access token: {e}")))?;
    let authorization = format!("Bearer {}", token.access_token);

    let body = getter.get(&identity_url(info), &[("Authorization", authorization.as_str())])?;
    let identity: ShieldedInstanceIdentity = serde_json::from_slice(&body)
        .map_err(|e| Error::Transient(format!("shielded instance identity: {e}")))?;
    let key = PKey::public_key_from_pem(identity.signing_key.ek_pub.as_bytes())
        .map_err(|e| Error::Transient(format!("shielded instance identity key: {e}")))?;

    let ak = document_ak(doc)?
        .to_pkey()
        .map_err(|e| Error::malformed("attestation key", e))?;
    if !key.public_eq(&ak) {
        return Err(Error::BindingMismatch(format!(
            "attestation key is not the signing key of instance {}",
            info.instance_name
        )));
    }
    Ok(key)
}

#[cfg(any(test, feature = "simulator"))]
pub mod testutil {
    use super::*;
    use crate::https::StaticGetter;
    use openssl::pkey::PKeyRef;

    pub fn info() -> GceInstanceInfo {
        GceInstanceInfo {
            project_id: "constellation-test".into(),
            instance_name: "worker-0".into(),
            zone: "europe-west3-b".into(),
        }
    }

    /// Metadata server and Compute API of an instance whose signing key is `key`.
    pub fn getter(key: &PKeyRef<Public>) -> StaticGetter {
        let info = info();
        let pem = String::from_utf8(key.public_key_to_pem().unwrap()).unwrap();
        StaticGetter::new()
            .with(&format!("{METADATA_URL}/project/project-id"), info.project_id.clone())
            .with(&format!("{METADATA_URL}/instance/name"), info.instance_name.clone())
            .with(
                &format!("{METADATA_URL}/instance/zone"),
                format!("projects/1234/zones/{}", info.zone),
            )
            .with(
                &format!("{METADATA_URL}/instance/service-accounts/default/token"),
                r#"{"access_token": "token", "expires_in": 3599, "token_type": "Bearer"}"#,
            )
            .with(
                &identity_url(&info),
                serde_json::to_vec(&serde_json::json!({
                    "signingKey": {"ekPub": pem},
                    "encryptionKey": {"ekPub": pem},
                }))
                .unwrap(),
            )
    }
}
