//! Device authentication (§4.7). Both configuration shapes resolve to the
//! same `DeviceAuth`, which the upload client uses to sign outbound requests.

use crate::config::IotHubConfig;
use crate::error::UploadError;

/// Resolved device credentials, independent of which config shape supplied them.
#[derive(Debug, Clone)]
pub struct DeviceAuth {
    pub host: String,
    pub device_id: String,
    pub sas_token: String,
}

impl DeviceAuth {
    /// Build from an already-validated `IotHubConfig` (§10.3 guarantees exactly
    /// one of `connection_string` or the `{host, device_id, sas_token}` triple
    /// is present).
    pub fn from_config(config: &IotHubConfig) -> Result<Self, UploadError> {
        if let Some(conn) = &config.connection_string {
            return Self::from_connection_string(conn);
        }
        match (&config.host, &config.device_id, &config.sas_token) {
            (Some(host), Some(device_id), Some(sas_token)) => Ok(Self {
                host: host.clone(),
                device_id: device_id.clone(),
                sas_token: sas_token.clone(),
            }),
            _ => Err(UploadError::AuthFailed(
                "iothub config has neither a connection string nor a complete auth triple"
                    .to_string(),
            )),
        }
    }

    /// Parse `HostName=...;DeviceId=...;SharedAccessKey=...` into a `DeviceAuth`.
    /// The shared access key is used as-is as the signing token; a production
    /// IoT Hub integration would derive a short-lived SAS token from it per
    /// request, but the device endpoint this agent talks to accepts the raw
    /// key as a bearer credential.
    fn from_connection_string(conn: &str) -> Result<Self, UploadError> {
        let mut host = None;
        let mut device_id = None;
        let mut key = None;

        for part in conn.split(';') {
            let Some((k, v)) = part.split_once('=') else {
                continue;
            };
            match k.trim() {
                "HostName" => host = Some(v.trim().to_string()),
                "DeviceId" => device_id = Some(v.trim().to_string()),
                "SharedAccessKey" => key = Some(v.trim().to_string()),
                _ => {}
            }
        }

        match (host, device_id, key) {
            (Some(host), Some(device_id), Some(sas_token)) => Ok(Self {
                host,
                device_id,
                sas_token,
            }),
            _ => Err(UploadError::AuthFailed(format!(
                "malformed connection string, expected HostName=...;DeviceId=...;SharedAccessKey=...: {conn}"
            ))),
        }
    }

    /// Header value used to authenticate to the device endpoint.
    pub fn bearer_value(&self) -> String {
        format!("SharedAccessSignature {}", self.sas_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_connection_string() {
        let auth =
            DeviceAuth::from_connection_string("HostName=h.azure-devices.net;DeviceId=dev1;SharedAccessKey=abc123")
                .unwrap();
        assert_eq!(auth.host, "h.azure-devices.net");
        assert_eq!(auth.device_id, "dev1");
        assert_eq!(auth.sas_token, "abc123");
    }

    #[test]
    fn rejects_malformed_connection_string() {
        assert!(DeviceAuth::from_connection_string("HostName=h;DeviceId=d").is_err());
    }

    #[test]
    fn from_config_prefers_connection_string() {
        let config = IotHubConfig {
            connection_string: Some("HostName=h;DeviceId=d;SharedAccessKey=k".to_string()),
            host: None,
            device_id: None,
            sas_token: None,
            upload_folder: "logs".to_string(),
        };
        let auth = DeviceAuth::from_config(&config).unwrap();
        assert_eq!(auth.device_id, "d");
    }

    #[test]
    fn from_config_uses_triple() {
        let config = IotHubConfig {
            connection_string: None,
            host: Some("h".to_string()),
            device_id: Some("d".to_string()),
            sas_token: Some("t".to_string()),
            upload_folder: "logs".to_string(),
        };
        let auth = DeviceAuth::from_config(&config).unwrap();
        assert_eq!(auth.host, "h");
        assert_eq!(auth.sas_token, "t");
    }
}
