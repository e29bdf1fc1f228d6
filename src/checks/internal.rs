use crate::models::ResultRecord;

/// A no-op check, useful for validating context data alone
pub fn internal_check(timeout: f64) -> ResultRecord {
    let mut record = ResultRecord::start("internal");
    record
        .spec
        .insert("timeout".to_string(), super::timeout_value(timeout));
    record.finish()
}
