//! Setting formatter: renders a [`SettingRecord`] as labeled lines.
//!
//! Blank fields are skipped, so an all-blank record costs nothing.

use lorekeep_core::setting::SettingRecord;

/// One labeled line per non-blank field, in a fixed order.
pub fn setting_lines(record: &SettingRecord) -> Vec<String> {
    let mut lines = Vec::new();
    for (label, value) in [
        ("World", &record.world),
        ("Location", &record.location),
        ("Time period", &record.time_period),
    ] {
        let value = value.trim();
        if !value.is_empty() {
            lines.push(format!("{label}: {value}"));
        }
    }

    let key_facts: Vec<&str> = record
        .key_facts
        .iter()
        .map(|f| f.trim())
        .filter(|f| !f.is_empty())
        .collect();
    if !key_facts.is_empty() {
        lines.push(format!("Key facts: {}", key_facts.join("; ")));
    }
    lines
}

/// The formatted setting block; empty for a blank record.
pub fn format_setting(record: &SettingRecord) -> String {
    setting_lines(record).join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> SettingRecord {
        SettingRecord {
            character_id: "mira".into(),
            ..Default::default()
        }
    }

    #[test]
    fn blank_record_formats_to_empty() {
        assert_eq!(format_setting(&record()), "");

        let mut r = record();
        r.world = "   ".into();
        r.key_facts = vec![" ".into(), String::new()];
        assert_eq!(format_setting(&r), "");
    }

    #[test]
    fn world_only_is_one_line() {
        let mut r = record();
        r.world = "Eldoria".into();
        let out = format_setting(&r);
        assert_eq!(out, "World: Eldoria");
        assert_eq!(out.lines().count(), 1);
    }

    #[test]
    fn full_record_in_fixed_order() {
        let r = SettingRecord {
            character_id: "mira".into(),
            world: " Eldoria ".into(),
            location: "The north lighthouse".into(),
            time_period: "Late autumn, year 412".into(),
            key_facts: vec!["Magic is outlawed".into(), "".into(), "The sea is rising".into()],
        };
        assert_eq!(
            format_setting(&r),
            "World: Eldoria\n\
             Location: The north lighthouse\n\
             Time period: Late autumn, year 412\n\
             Key facts: Magic is outlawed; The sea is rising"
        );
    }
}
