//! Verification sidecar written next to block store volumes.
//!
//! A JSON array describing every remote file the store knows about. `State` and
//! `Type` are stored as integers.

use {
    anyhow::{Error, bail},
    serde::{Deserialize, Serialize},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum RemoteVolumeState {
    Temporary = 0,
    Uploading = 1,
    Uploaded = 2,
    Verified = 3,
    Deleting = 4,
    Deleted = 5,
}

impl TryFrom<i64> for RemoteVolumeState {
    type Error = Error;

    #[inline]
    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Temporary),
            1 => Ok(Self::Uploading),
            2 => Ok(Self::Uploaded),
            3 => Ok(Self::Verified),
            4 => Ok(Self::Deleting),
            5 => Ok(Self::Deleted),
            _ => bail!("invalid value for RemoteVolumeState: {value}"),
        }
    }
}

impl From<RemoteVolumeState> for i64 {
    #[inline]
    fn from(value: RemoteVolumeState) -> Self {
        match value {
            RemoteVolumeState::Temporary => 0,
            RemoteVolumeState::Uploading => 1,
            RemoteVolumeState::Uploaded => 2,
            RemoteVolumeState::Verified => 3,
            RemoteVolumeState::Deleting => 4,
            RemoteVolumeState::Deleted => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum RemoteVolumeType {
    Blocks = 0,
    Files = 1,
    Index = 2,
}

impl TryFrom<i64> for RemoteVolumeType {
    type Error = Error;

    #[inline]
    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Blocks),
            1 => Ok(Self::Files),
            2 => Ok(Self::Index),
            _ => bail!("invalid value for RemoteVolumeType: {value}"),
        }
    }
}

impl From<RemoteVolumeType> for i64 {
    #[inline]
    fn from(value: RemoteVolumeType) -> Self {
        match value {
            RemoteVolumeType::Blocks => 0,
            RemoteVolumeType::Files => 1,
            RemoteVolumeType::Index => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SidecarEntry {
    pub name: String,
    /// Standard base64 of the SHA-256 of the stored file.
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub size: u64,
    pub state: RemoteVolumeState,
    #[serde(rename = "Type")]
    pub kind: RemoteVolumeType,
}

/// Conventional suffix of sidecar file names.
pub const SIDECAR_SUFFIX: &str = "-verification.json";

#[cfg(test)]
#[expect(clippy::unwrap_used, clippy::indexing_slicing, reason = "test")]
mod tests {
    use super::*;

    #[test]
    fn json_shape() {
        let text = r#"[{"Name":"a.dblock","Hash":"qqq=","Size":12,"State":3,"Type":0},
                       {"Name":"b.dlist","Hash":null,"Size":0,"State":5,"Type":1}]"#;
        let entries: Vec<SidecarEntry> = serde_json::from_str(text).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].state, RemoteVolumeState::Verified);
        assert_eq!(entries[1].kind, RemoteVolumeType::Files);
        assert_eq!(entries[1].hash, None);
        let back = serde_json::to_string(&entries[0]).unwrap();
        assert_eq!(
            back,
            r#"{"Name":"a.dblock","Hash":"qqq=","Size":12,"State":3,"Type":0}"#
        );
        serde_json::from_str::<SidecarEntry>(
            r#"{"Name":"x","Hash":"","Size":1,"State":9,"Type":0}"#,
        )
        .unwrap_err();
    }
}
