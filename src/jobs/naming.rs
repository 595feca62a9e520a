//! Job naming rules.
//!
//! A job name is a filesystem-safe version of the display name with the
//! formal charge appended as `_pos<N>` / `_neg<N>`. Everything downstream
//! (variant selection, the define script's charge) reads the charge and the
//! conformer group back out of the name through this module only.

use crate::models::GroupKey;

/// Filesystem-safe job name with charge suffix; empty when nothing usable remains
pub fn clean_name(display: &str, charge: i32) -> String {
    let mut cleaned = String::with_capacity(display.len());
    for c in display.trim().chars() {
        let c = if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
            c
        } else {
            '_'
        };
        if c == '_' && cleaned.ends_with('_') {
            continue;
        }
        cleaned.push(c);
    }

    let cleaned = cleaned.trim_matches('_');
    if cleaned.is_empty() {
        return String::new();
    }

    let mut name = String::new();
    if cleaned.starts_with(|c: char| c.is_ascii_digit()) {
        name.push('m');
    }
    name.push_str(cleaned);
    name.push_str(&charge_suffix(charge));
    name
}

pub fn charge_suffix(charge: i32) -> String {
    match charge {
        0 => String::new(),
        c if c > 0 => format!("_pos{c}"),
        c => format!("_neg{}", c.unsigned_abs()),
    }
}

/// Split a trailing `_pos<N>` / `_neg<N>` off a name
fn split_charge(name: &str) -> (&str, i32) {
    if let Some((stem, tail)) = name.rsplit_once('_') {
        for (prefix, sign) in [("pos", 1), ("neg", -1)] {
            if let Some(digits) = tail.strip_prefix(prefix) {
                if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                    if let Ok(n) = digits.parse::<i32>() {
                        return (stem, sign * n);
                    }
                }
            }
        }
    }
    (name, 0)
}

/// `mol_pos2` → 2, `mol_neg1` → -1, anything else → 0
pub fn parse_charge(name: &str) -> i32 {
    split_charge(name).1
}

/// Conformer group of a job name: the charge suffix is dropped, then a
/// numeric tail after the last `_` becomes the rank.
pub fn parse_group_key(name: &str) -> GroupKey {
    let (stem, _) = split_charge(name);
    if let Some((base, tail)) = stem.rsplit_once('_') {
        if !base.is_empty() && !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(rank) = tail.parse::<u32>() {
                return GroupKey {
                    base: base.to_string(),
                    rank: Some(rank),
                };
            }
        }
    }
    GroupKey {
        base: stem.to_string(),
        rank: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_name() {
        assert_eq!(clean_name("Perfluorooctanoic acid", -1), "Perfluorooctanoic_acid_neg1");
        assert_eq!(clean_name("2,4-D", 0), "m2_4-D");
        assert_eq!(clean_name("  (R)-Carvone ", 0), "R_-Carvone");
        assert_eq!(clean_name("NH4+", 1), "NH4_pos1");
        assert_eq!(clean_name("???", 0), "");
    }

    #[test]
    fn test_parse_charge() {
        assert_eq!(parse_charge("mol_pos2"), 2);
        assert_eq!(parse_charge("mol_neg1"), -1);
        assert_eq!(parse_charge("mol"), 0);
        assert_eq!(parse_charge("mol_posX"), 0);
        assert_eq!(parse_charge("mol_pos"), 0);
    }

    #[test]
    fn test_parse_group_key() {
        assert_eq!(
            parse_group_key("PFOA_12_neg1"),
            GroupKey {
                base: "PFOA".to_string(),
                rank: Some(12)
            }
        );
        assert_eq!(
            parse_group_key("water"),
            GroupKey {
                base: "water".to_string(),
                rank: None
            }
        );
        assert_eq!(parse_group_key("m2_4-D").rank, None);
    }

    #[test]
    fn test_charge_suffix_round_trip() {
        for charge in [-3, -1, 0, 1, 2] {
            assert_eq!(parse_charge(&clean_name("x", charge)), charge);
        }
    }
}
