/// API version v1alpha1 for Datum mesh CRDs

pub mod workload_entry;

pub use workload_entry::{WorkloadEntry, WorkloadEntrySpec};

