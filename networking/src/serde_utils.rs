use serde::{Deserialize, Deserializer, Serializer, de::Error as SerdeError};

/// Integers as `0x`-prefixed hex quantities, the way node RPC reports sync
/// status. Plain JSON numbers are accepted when reading.
pub mod quantity {
    use super::{Deserialize, Deserializer, SerdeError, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    pub fn serialize<S>(value: &u64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{value:#x}"))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Number(value) => Ok(value),
            Raw::Text(text) => {
                let digits = text
                    .strip_prefix("0x")
                    .ok_or_else(|| SerdeError::custom(format!("quantity {text:?} lacks 0x prefix")))?;
                if digits.is_empty() || (digits.len() > 1 && digits.starts_with('0')) {
                    return Err(SerdeError::custom(format!("malformed quantity {text:?}")));
                }
                u64::from_str_radix(digits, 16)
                    .map_err(|err| SerdeError::custom(format!("invalid quantity {text:?}: {err}")))
            }
        }
    }
}
