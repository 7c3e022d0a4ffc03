use std::collections::HashMap;

use prometheus::Registry;

pub const NAMESPACE: &str = "kdispatch";

pub const LABEL_CLIENT_ID: &str = "client_id";
pub const LABEL_SUBSCRIPTION: &str = "subscription";
pub const LABEL_STATUS: &str = "status";
pub const LABEL_OUTCOME: &str = "outcome";
pub const LABEL_REASON: &str = "reason";

/// Create the [`Registry`] every component registers its metrics with.
///
/// All metrics are prefixed with [`NAMESPACE`], and labelled with the `client_id` of the
/// dispatcher instance.
pub fn init(client_id: String) -> Registry {
    let prom_def_labels = HashMap::from([(LABEL_CLIENT_ID.to_string(), client_id)]);

    info!("Prometheus Metrics default labels:\n{:#?}", prom_def_labels);

    Registry::new_custom(Some(NAMESPACE.to_string()), Some(prom_def_labels))
        .unwrap_or_else(|e| panic!("Unable to create a Prometheus Metrics Registry: {e}"))
}
