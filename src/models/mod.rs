//! Netchecks model layer
//!
//! Structure:
//! - `network_assertion` - the NetworkAssertion CRD
//! - `config_document` - the probe configuration stored in the ConfigMap
//! - `output` - the probe output document and result records
//! - `policy_report` - PolicyReport entries and summary

pub mod config_document;
pub mod network_assertion;
pub mod output;
pub mod policy_report;

pub use config_document::{AssertionConfig, ContextEntry, ResolvedConfig};
pub use network_assertion::{
    ContextDef, CreationStatus, Expected, NetworkAssertion, NetworkAssertionSpec,
    NetworkAssertionStatus, Rule, RuleType,
};
pub use output::{AssertionResult, OutputDocument, ResultRecord, Status};
pub use policy_report::{K8sTimestamp, PolicyReportEntry, PolicyReportSummary};
