//! Volume plugin protocol messages.
//!
//! Every call is an HTTP `POST` to `/<Interface>.<Method>` with a JSON body.
//! [`PluginRequest::decode`] turns a path and body into a typed request, and
//! [`PluginResponse`] renders the JSON the orchestrator expects back.  Field
//! names are PascalCase on the wire.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::VolumeError;
use crate::types::{Scope, VolumeEntry, VolumeInfo};

/// Content type of every plugin response.
pub const CONTENT_TYPE: &str = "application/vnd.docker.plugins.v1.1+json";

/// Interface advertised by `/Plugin.Activate`.
pub const IMPLEMENTS: &str = "VolumeDriver";

/// A decoded plugin call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginRequest {
    Activate,
    Create {
        name: String,
        options: HashMap<String, String>,
    },
    Remove {
        name: String,
    },
    Path {
        name: String,
    },
    /// `id` identifies the consumer; only logged.
    Mount {
        name: String,
        id: String,
    },
    Unmount {
        name: String,
        id: String,
    },
    Get {
        name: String,
    },
    List,
    Capabilities,
}

/// Why a request could not be decoded.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown plugin method {0}")]
    UnknownRoute(String),
    #[error("malformed request body: {0}")]
    Malformed(String),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NameBody {
    #[serde(rename = "Name")]
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CreateBody {
    #[serde(rename = "Name")]
    name: String,
    // The orchestrator sends `null` when no options were given.
    #[serde(rename = "Opts")]
    opts: Option<HashMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MountBody {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "ID")]
    id: String,
}

fn parse<'a, B>(body: &'a [u8]) -> Result<B, DecodeError>
where
    B: Deserialize<'a> + Default,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(B::default());
    }
    serde_json::from_slice(body).map_err(|e| DecodeError::Malformed(e.to_string()))
}

impl PluginRequest {
    /// Decode the call addressed to `path`.  An empty body decodes as an
    /// all-defaults request.
    pub fn decode(path: &str, body: &[u8]) -> Result<Self, DecodeError> {
        let req = match path {
            "/Plugin.Activate" => Self::Activate,
            "/VolumeDriver.Create" => {
                let b: CreateBody = parse(body)?;
                Self::Create {
                    name: b.name,
                    options: b.opts.unwrap_or_default(),
                }
            }
            "/VolumeDriver.Remove" => Self::Remove {
                name: parse::<NameBody>(body)?.name,
            },
            "/VolumeDriver.Path" => Self::Path {
                name: parse::<NameBody>(body)?.name,
            },
            "/VolumeDriver.Mount" => {
                let b: MountBody = parse(body)?;
                Self::Mount {
                    name: b.name,
                    id: b.id,
                }
            }
            "/VolumeDriver.Unmount" => {
                let b: MountBody = parse(body)?;
                Self::Unmount {
                    name: b.name,
                    id: b.id,
                }
            }
            "/VolumeDriver.Get" => Self::Get {
                name: parse::<NameBody>(body)?.name,
            },
            "/VolumeDriver.List" => Self::List,
            "/VolumeDriver.Capabilities" => Self::Capabilities,
            other => return Err(DecodeError::UnknownRoute(other.to_owned())),
        };
        Ok(req)
    }
}

impl fmt::Display for PluginRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Activate => f.write_str("Activate"),
            Self::Create { name, .. } => write!(f, "Create({name})"),
            Self::Remove { name } => write!(f, "Remove({name})"),
            Self::Path { name } => write!(f, "Path({name})"),
            Self::Mount { name, id } => write!(f, "Mount({name}, id={id})"),
            Self::Unmount { name, id } => write!(f, "Unmount({name}, id={id})"),
            Self::Get { name } => write!(f, "Get({name})"),
            Self::List => f.write_str("List"),
            Self::Capabilities => f.write_str("Capabilities"),
        }
    }
}

/// Volume as reported by `List`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListedVolume {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Mountpoint")]
    pub mountpoint: String,
}

impl From<VolumeEntry> for ListedVolume {
    fn from(e: VolumeEntry) -> Self {
        Self {
            name: e.name,
            mountpoint: e.mountpoint.display().to_string(),
        }
    }
}

/// Volume as reported by `Get`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeDetail {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Mountpoint")]
    pub mountpoint: String,
    /// RFC 3339.
    #[serde(rename = "CreatedAt")]
    pub created_at: String,
    #[serde(rename = "Status")]
    pub status: HashMap<String, String>,
}

impl From<VolumeInfo> for VolumeDetail {
    fn from(info: VolumeInfo) -> Self {
        Self {
            status: info.status(),
            name: info.name,
            mountpoint: info.mountpoint.display().to_string(),
            created_at: info.metadata.created_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CapabilitySet {
    #[serde(rename = "Scope")]
    pub scope: Scope,
}

/// Response body of a plugin call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum PluginResponse {
    Implements {
        #[serde(rename = "Implements")]
        implements: Vec<String>,
    },
    Mountpoint {
        #[serde(rename = "Mountpoint")]
        mountpoint: String,
    },
    Volume {
        #[serde(rename = "Volume")]
        volume: VolumeDetail,
    },
    Volumes {
        #[serde(rename = "Volumes")]
        volumes: Vec<ListedVolume>,
    },
    Capabilities {
        #[serde(rename = "Capabilities")]
        capabilities: CapabilitySet,
    },
    Error {
        #[serde(rename = "Err")]
        err: String,
    },
    /// `{}`.
    Ok {},
}

impl PluginResponse {
    pub fn error(msg: impl fmt::Display) -> Self {
        Self::Error {
            err: msg.to_string(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

impl From<VolumeError> for PluginResponse {
    fn from(e: VolumeError) -> Self {
        Self::error(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{VolumeMetadata, VolumeOptions};
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::path::PathBuf;

    #[test]
    fn decode_create_with_and_without_opts() {
        let req = PluginRequest::decode(
            "/VolumeDriver.Create",
            br#"{"Name":"vol1","Opts":{"share":"data"}}"#,
        )
        .unwrap();
        assert_eq!(
            req,
            PluginRequest::Create {
                name: "vol1".into(),
                options: HashMap::from([("share".to_owned(), "data".to_owned())]),
            }
        );

        let req =
            PluginRequest::decode("/VolumeDriver.Create", br#"{"Name":"vol1","Opts":null}"#)
                .unwrap();
        assert!(matches!(req, PluginRequest::Create { ref options, .. } if options.is_empty()));
    }

    #[test]
    fn decode_mount_carries_id() {
        let req =
            PluginRequest::decode("/VolumeDriver.Mount", br#"{"Name":"v","ID":"abc"}"#).unwrap();
        assert_eq!(
            req,
            PluginRequest::Mount {
                name: "v".into(),
                id: "abc".into()
            }
        );
    }

    #[test]
    fn empty_bodies_decode_as_defaults() {
        assert_eq!(
            PluginRequest::decode("/VolumeDriver.List", b"").unwrap(),
            PluginRequest::List
        );
        assert_eq!(
            PluginRequest::decode("/VolumeDriver.Get", b"").unwrap(),
            PluginRequest::Get { name: String::new() }
        );
        assert_eq!(
            PluginRequest::decode("/Plugin.Activate", b"{}").unwrap(),
            PluginRequest::Activate
        );
    }

    #[test]
    fn decode_failures() {
        assert_eq!(
            PluginRequest::decode("/VolumeDriver.Snapshot", b"{}"),
            Err(DecodeError::UnknownRoute("/VolumeDriver.Snapshot".into()))
        );
        assert!(matches!(
            PluginRequest::decode("/VolumeDriver.Remove", b"{not json"),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn response_shapes() {
        let to_json = |r: &PluginResponse| serde_json::to_value(r).unwrap();

        assert_eq!(to_json(&PluginResponse::Ok {}), json!({}));
        assert_eq!(
            to_json(&PluginResponse::error(VolumeError::NotFound("v".into()))),
            json!({"Err": "volume v not found"})
        );
        assert_eq!(
            to_json(&PluginResponse::Capabilities {
                capabilities: CapabilitySet {
                    scope: Scope::Local
                }
            }),
            json!({"Capabilities": {"Scope": "local"}})
        );
        assert_eq!(
            to_json(&PluginResponse::Volumes {
                volumes: vec![ListedVolume {
                    name: "a".into(),
                    mountpoint: "/mnt/a".into()
                }]
            }),
            json!({"Volumes": [{"Name": "a", "Mountpoint": "/mnt/a"}]})
        );
    }

    #[test]
    fn volume_detail_from_info() {
        let info = VolumeInfo {
            name: "vol1".into(),
            mountpoint: PathBuf::from("/mnt/vol1"),
            metadata: VolumeMetadata {
                created_at: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
                account: "acct".into(),
                options: VolumeOptions {
                    share: "data".into(),
                },
            },
        };
        let body = serde_json::to_value(PluginResponse::Volume {
            volume: info.into(),
        })
        .unwrap();
        assert_eq!(body["Volume"]["Name"], "vol1");
        assert_eq!(body["Volume"]["Mountpoint"], "/mnt/vol1");
        assert_eq!(body["Volume"]["CreatedAt"], "2024-01-02T03:04:05+00:00");
        assert_eq!(body["Volume"]["Status"]["share"], "data");
    }
}
