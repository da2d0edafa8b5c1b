//! Register map and decoding of raw holding-register words into measurements

use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Invalid payload length: expected {expected} registers, got {actual}")]
    InvalidPayloadLength { expected: usize, actual: usize },
}

/// Largest decimal scale a map entry may carry
pub const MAX_SCALE: u32 = 10;

/// One block of consecutive registers and the decimal scale of its values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "(u16, u16, u32)")]
pub struct RegisterMapEntry {
    pub address: u16,
    pub count: u16,
    pub scale: u32,
}

impl From<(u16, u16, u32)> for RegisterMapEntry {
    fn from((address, count, scale): (u16, u16, u32)) -> Self {
        Self { address, count, scale }
    }
}

impl RegisterMapEntry {
    /// Even counts hold double-word values
    pub fn is_double_word(&self) -> bool {
        self.count % 2 == 0
    }

    /// Number of measurements this entry expands to
    pub fn value_count(&self) -> usize {
        if self.is_double_word() {
            usize::from(self.count / 2)
        } else {
            usize::from(self.count)
        }
    }
}

/// Field names and their entries, in the order the columns are written
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegisterMap {
    entries: Vec<(String, RegisterMapEntry)>,
}

impl RegisterMap {
    pub fn new(entries: Vec<(String, RegisterMapEntry)>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[(String, RegisterMapEntry)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Column name of every decoded value. Entries yielding several values
    /// get a numeric suffix per value.
    pub fn column_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for (name, entry) in &self.entries {
            match entry.value_count() {
                1 => names.push(name.clone()),
                n => names.extend((1..=n).map(|i| format!("{}_{}", name, i))),
            }
        }
        names
    }
}

impl<'de> Deserialize<'de> for RegisterMap {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct OrderedVisitor;

        impl<'de> Visitor<'de> for OrderedVisitor {
            type Value = RegisterMap;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an object of field name to [address, count, scale]")
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries: Vec<(String, RegisterMapEntry)> = Vec::new();
                while let Some((name, entry)) = access.next_entry::<String, RegisterMapEntry>()? {
                    if entry.count == 0 {
                        return Err(de::Error::custom(format!(
                            "register `{}` must read at least one word",
                            name
                        )));
                    }
                    if entry.scale > MAX_SCALE {
                        return Err(de::Error::custom(format!(
                            "register `{}` has scale {}, at most {} is supported",
                            name, entry.scale, MAX_SCALE
                        )));
                    }
                    if entries.iter().any(|(existing, _)| *existing == name) {
                        return Err(de::Error::custom(format!("duplicate register `{}`", name)));
                    }
                    entries.push((name, entry));
                }
                Ok(RegisterMap { entries })
            }
        }

        deserializer.deserialize_map(OrderedVisitor)
    }
}

/// Converts the raw words read for `entry` into physical values.
///
/// Double-word entries pair the words as `(hi, lo)`. The meter leaves `hi` at
/// zero when the value fits in `lo`; otherwise the value is the decimal digits
/// of `hi` followed by the decimal digits of `lo` (hi=12, lo=345 gives 12345).
/// Single-word entries scale each word on its own.
pub fn decode(entry: &RegisterMapEntry, raw: &[u16]) -> Result<Vec<f64>, DecodeError> {
    let expected = usize::from(entry.count);
    if raw.len() != expected {
        return Err(DecodeError::InvalidPayloadLength {
            expected,
            actual: raw.len(),
        });
    }

    let divisor = 10f64.powi(i32::try_from(entry.scale).unwrap_or(i32::MAX));
    let values = if entry.is_double_word() {
        raw.chunks_exact(2)
            .map(|pair| concat_digits(pair[0], pair[1]) as f64 / divisor)
            .collect()
    } else {
        raw.iter().map(|&word| f64::from(word) / divisor).collect()
    };
    Ok(values)
}

fn concat_digits(hi: u16, lo: u16) -> u64 {
    if hi == 0 {
        return u64::from(lo);
    }
    let mut shift = 10u64;
    while u64::from(lo) >= shift {
        shift *= 10;
    }
    u64::from(hi) * shift + u64::from(lo)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(address: u16, count: u16, scale: u32) -> RegisterMapEntry {
        RegisterMapEntry { address, count, scale }
    }

    #[test]
    fn absent_high_word_uses_low_word() {
        assert_eq!(decode(&entry(100, 2, 3), &[0, 1500]).unwrap(), vec![1.5]);
    }

    #[test]
    fn high_word_digits_are_concatenated() {
        assert_eq!(decode(&entry(100, 2, 0), &[7, 250]).unwrap(), vec![7250.0]);
        assert_eq!(decode(&entry(100, 2, 2), &[12, 345]).unwrap(), vec![123.45]);
    }

    #[test]
    fn zero_low_word_keeps_its_digit() {
        assert_eq!(decode(&entry(100, 2, 0), &[7, 0]).unwrap(), vec![70.0]);
        assert_eq!(decode(&entry(100, 2, 0), &[1, 10]).unwrap(), vec![110.0]);
    }

    #[test]
    fn single_words_scale_independently() {
        assert_eq!(decode(&entry(100, 1, 1), &[330]).unwrap(), vec![33.0]);
        assert_eq!(
            decode(&entry(100, 3, 2), &[5000, 4990, 0]).unwrap(),
            vec![50.0, 49.9, 0.0]
        );
    }

    #[test]
    fn double_word_blocks_expand_per_pair() {
        let values = decode(&entry(100, 6, 1), &[0, 2301, 0, 2299, 1, 2]).unwrap();
        assert_eq!(values, vec![230.1, 229.9, 1.2]);
    }

    #[test]
    fn wrong_length_is_rejected() {
        assert_eq!(
            decode(&entry(100, 2, 0), &[1]),
            Err(DecodeError::InvalidPayloadLength { expected: 2, actual: 1 })
        );
    }

    #[test]
    fn map_keeps_document_order() {
        let map: RegisterMap =
            serde_json::from_str(r#"{"z": [10, 1, 0], "a": [20, 2, 3], "m": [30, 4, 1]}"#).unwrap();
        let names: Vec<_> = map.entries().iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["z", "a", "m"]);
        assert_eq!(map.entries()[1].1, entry(20, 2, 3));
        assert_eq!(map.column_names(), ["z", "a", "m_1", "m_2"]);
    }

    #[test]
    fn map_rejects_empty_reads_and_duplicates() {
        assert!(serde_json::from_str::<RegisterMap>(r#"{"v": [100, 0, 1]}"#).is_err());
        assert!(serde_json::from_str::<RegisterMap>(r#"{"v": [1, 1, 1], "v": [2, 1, 1]}"#).is_err());
    }

    #[test]
    fn map_rejects_scales_past_the_limit() {
        let map: RegisterMap = serde_json::from_str(r#"{"e": [100, 2, 10]}"#).unwrap();
        assert_eq!(map.entries()[0].1.scale, MAX_SCALE);
        assert!(serde_json::from_str::<RegisterMap>(r#"{"e": [100, 2, 11]}"#).is_err());
        assert!(serde_json::from_str::<RegisterMap>(r#"{"e": [100, 2, 4294967295]}"#).is_err());
    }

    #[test]
    fn huge_scale_divides_towards_zero() {
        // Entries built in code skip the map check
        let values = decode(&entry(100, 1, u32::MAX), &[5000]).unwrap();
        assert_eq!(values, vec![0.0]);
    }
}
