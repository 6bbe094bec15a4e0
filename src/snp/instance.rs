// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::certs::{guid, CertTable};
use crate::document::base64_bytes;
use crate::error::{Error, Result};
use crate::tsm::TsmReport;
use openssl::x509::X509;
use serde::{Deserialize, Serialize};

/// Evidence SNP issuers put into a document's instance info.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct SnpInstanceInfo {
    /// PEM encoded VCEK or VLEK. May be empty for VCEK signed reports.
    #[serde(with = "base64_bytes", default)]
    pub report_signer: Vec<u8>,
    /// PEM encoded ASK and/or ARK.
    #[serde(with = "base64_bytes", default)]
    pub cert_chain: Vec<u8>,
    #[serde(with = "base64_bytes", default)]
    pub attestation_report: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzureInstanceInfo>,
    #[serde(rename = "GCP", default, skip_serializing_if = "Option::is_none")]
    pub gcp: Option<GceInstanceInfo>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct AzureInstanceInfo {
    /// Runtime data JSON whose digest is in the report data.
    #[serde(rename = "RuntimeData", with = "base64_bytes", default)]
    pub runtime_data: Vec<u8>,
    #[serde(rename = "MAAToken", default)]
    pub maa_token: String,
}

/// Identity of a GCE instance.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct GceInstanceInfo {
    #[serde(rename = "project_id", alias = "ProjectID")]
    pub project_id: String,
    #[serde(rename = "instance_name", alias = "InstanceName")]
    pub instance_name: String,
    #[serde(rename = "zone", alias = "Zone")]
    pub zone: String,
}

impl SnpInstanceInfo {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::malformed("instance info", e))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Evidence from an extended report. The signing certificate and any
    /// chain certificates are taken from the certificate table.
    pub fn from_extended_report(report: TsmReport) -> Result<Self> {
        let mut info = SnpInstanceInfo {
            attestation_report: report.outblob,
            ..Default::default()
        };
        if report.auxblob.is_empty() {
            log::warn!("extended report carries no certificates");
            return Ok(info);
        }
        let table = CertTable::parse(&report.auxblob)
            .map_err(|e| Error::Io(format!("certificate table: {e}")))?;
        let pem = |der: &[u8]| -> Result<Vec<u8>> {
            X509::from_der(der)
                .and_then(|c| c.to_pem())
                .map_err(|e| Error::Io(format!("certificate table: {e}")))
        };

        if let Some(der) = table.get(guid::VLEK).or_else(|| table.get(guid::VCEK)) {
            info.report_signer = pem(der)?;
        }
        for id in [guid::ASK, guid::ARK] {
            if let Some(der) = table.get(id) {
                info.cert_chain.extend(pem(der)?);
            }
        }
        Ok(info)
    }

    pub fn azure(&self) -> Result<&AzureInstanceInfo> {
        self.azure
            .as_ref()
            .ok_or_else(|| Error::MalformedDocument("instance info carries no Azure data".into()))
    }

    pub fn gcp(&self) -> Result<&GceInstanceInfo> {
        self.gcp
            .as_ref()
            .ok_or_else(|| Error::MalformedDocument("instance info carries no GCE data".into()))
    }
}
