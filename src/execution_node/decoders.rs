use serde::{Deserialize, Deserializer};

pub fn from_i32_hex_str<'de, D>(deserializer: D) -> Result<i32, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    i32::from_str_radix(s.trim_start_matches("0x"), 16).map_err(serde::de::Error::custom)
}
