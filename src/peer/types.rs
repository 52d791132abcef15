use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Description type tag. Only offers and answers travel over signaling.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpType::Offer => f.write_str("offer"),
            SdpType::Answer => f.write_str("answer"),
        }
    }
}

/// `{ "type": "offer" | "answer", "sdp": "..." }`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Parses an inbound signaling record.
    pub fn from_json(value: &Value) -> Result<Self> {
        let desc: Self = Self::deserialize(value)
            .map_err(|e| Error::malformed(format!("session description: {e}")))?;
        desc.validate()?;
        Ok(desc)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sdp.trim().is_empty() {
            return Err(Error::malformed("session description: empty sdp"));
        }
        Ok(())
    }

    pub fn to_json(&self) -> Value {
        serde_json::json!({ "type": self.sdp_type, "sdp": self.sdp })
    }
}

/// `{ "sdpMid": "...", "sdpMLineIndex": 0, "candidate": "..." }`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    #[serde(rename = "sdpMid")]
    pub sdp_mid: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: u16,
    pub candidate: String,
}

impl IceCandidate {
    pub fn new(sdp_mid: impl Into<String>, sdp_mline_index: u16, candidate: impl Into<String>) -> Self {
        Self {
            sdp_mid: sdp_mid.into(),
            sdp_mline_index,
            candidate: candidate.into(),
        }
    }

    /// Parses an inbound signaling record.
    pub fn from_json(value: &Value) -> Result<Self> {
        let cand: Self = Self::deserialize(value)
            .map_err(|e| Error::malformed(format!("ice candidate: {e}")))?;
        cand.validate()?;
        Ok(cand)
    }

    pub fn validate(&self) -> Result<()> {
        if self.candidate.trim().is_empty() {
            return Err(Error::malformed("ice candidate: empty candidate line"));
        }
        Ok(())
    }

    /// `host`, `srflx`, `prflx` or `relay`, when the line carries a `typ`.
    pub fn candidate_type(&self) -> Option<&str> {
        let mut parts = self.candidate.split_whitespace();
        parts.find(|p| *p == "typ")?;
        parts.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn description_uses_wire_field_names() {
        let desc = SessionDescription::answer("v=0\r\n");
        let value = serde_json::to_value(&desc).unwrap();
        assert_eq!(value, json!({"type": "answer", "sdp": "v=0\r\n"}));
        assert_eq!(desc.to_json(), value);
    }

    #[test]
    fn description_missing_sdp_is_malformed() {
        let err = SessionDescription::from_json(&json!({"type": "offer"})).unwrap_err();
        assert!(matches!(err, Error::MalformedMessage(_)));
    }

    #[test]
    fn description_unknown_type_is_malformed() {
        let err = SessionDescription::from_json(&json!({"type": "pranswer", "sdp": "v=0"}))
            .unwrap_err();
        assert!(matches!(err, Error::MalformedMessage(_)));
    }

    #[test]
    fn candidate_parses_wire_record() {
        let cand = IceCandidate::from_json(&json!({
            "sdpMid": "0",
            "sdpMLineIndex": 0,
            "candidate": "candidate:1 1 udp 2130706431 192.168.1.5 50000 typ host"
        }))
        .unwrap();
        assert_eq!(cand.sdp_mid, "0");
        assert_eq!(cand.candidate_type(), Some("host"));
    }

    #[test]
    fn candidate_missing_index_is_malformed() {
        let err = IceCandidate::from_json(&json!({"sdpMid": "0", "candidate": "candidate:1"}))
            .unwrap_err();
        assert!(matches!(err, Error::MalformedMessage(_)));
    }

    #[test]
    fn candidate_negative_index_is_malformed() {
        let err = IceCandidate::from_json(&json!({
            "sdpMid": "0", "sdpMLineIndex": -1, "candidate": "candidate:1"
        }))
        .unwrap_err();
        assert!(matches!(err, Error::MalformedMessage(_)));
    }
}
