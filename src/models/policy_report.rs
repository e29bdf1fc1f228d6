//! PolicyReport types (`wgpolicyk8s.io/v1alpha2`)
//!
//! The report is read and written as a `DynamicObject`; these structs describe
//! the parts netchecks owns.

use kube::core::{ApiResource, GroupVersionKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const POLICY_REPORT_GROUP: &str = "wgpolicyk8s.io";
pub const POLICY_REPORT_VERSION: &str = "v1alpha2";
pub const POLICY_REPORT_KIND: &str = "PolicyReport";
pub const POLICY_REPORT_PLURAL: &str = "policyreports";

/// Value of `source` on every entry netchecks writes
pub const REPORT_SOURCE: &str = "netchecks";

/// ApiResource for the PolicyReport CRD
pub fn policy_report_api_resource() -> ApiResource {
    let gvk = GroupVersionKind::gvk(
        POLICY_REPORT_GROUP,
        POLICY_REPORT_VERSION,
        POLICY_REPORT_KIND,
    );
    ApiResource::from_gvk_with_plural(&gvk, POLICY_REPORT_PLURAL)
}

/// Kubernetes meta/v1.Timestamp
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct K8sTimestamp {
    pub seconds: i64,
    pub nanos: i32,
}

/// One row of a PolicyReport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyReportEntry {
    pub source: String,
    pub policy: String,
    pub rule: String,
    pub category: String,
    pub timestamp: K8sTimestamp,
    pub result: String,
    pub message: String,
    /// `spec` and `data` of the result record, each JSON-encoded
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// Per-status counts. Absent buckets are omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyReportSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warn: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<u32>,
}

impl PolicyReportSummary {
    /// Increment the bucket named by a result status. Unknown names count as skip.
    pub fn record(&mut self, status: &str) {
        let bucket = match status {
            "pass" => &mut self.pass,
            "fail" => &mut self.fail,
            "warn" => &mut self.warn,
            "error" => &mut self.error,
            _ => &mut self.skip,
        };
        *bucket = Some(bucket.unwrap_or(0) + 1);
    }

    /// Merge-patch form: every bucket present, missing ones explicitly null so
    /// a previously non-zero count disappears.
    pub fn to_merge_patch(&self) -> serde_json::Value {
        serde_json::json!({
            "pass": self.pass,
            "fail": self.fail,
            "warn": self.warn,
            "error": self.error,
            "skip": self.skip,
        })
    }
}
