//! Rendering of worker sources from job specs.
//!
//! Templates are Handlebars text rendered in strict mode, so a template
//! referencing a parameter the job does not define fails instead of
//! silently rendering an empty string. Output is not HTML-escaped.

use std::collections::BTreeSet;

use boostrun_core::{JobSpec, Workload};
use handlebars::Handlebars;
use serde::Serialize;

use crate::error::SupervisorError;

/// Default template of the serving worker.
pub const SERVING_TEMPLATE: &str = include_str!("../templates/loader.py.hbs");

/// Default template of the per-buffer model trainer.
pub const MODEL_TEMPLATE: &str = include_str!("../templates/model.py.hbs");

/// Default template of the ensemble trainer.
pub const ENSEMBLE_TEMPLATE: &str = include_str!("../templates/ensemble.py.hbs");

/// Template used for `workload` when the job does not supply its own.
pub fn default_template(workload: &Workload) -> &'static str {
    match workload {
        Workload::Serving => SERVING_TEMPLATE,
        Workload::TrainModel { .. } => MODEL_TEMPLATE,
        Workload::TrainEnsemble => ENSEMBLE_TEMPLATE,
    }
}

/// Parameters visible to a worker template.
///
/// Each workload sees only its own parameters; the rest are left out of the
/// render context, so strict rendering rejects templates that print or
/// iterate over them. `data_root` and `buckets` are always present. The serving worker
/// adds `address`, `port` and `buffers`, the ensemble trainer adds
/// `buffers`, and the model trainer adds `buffer`, `threshold` and
/// `continue_training`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemplateParams {
    pub data_root: String,
    /// Buckets in caller order, first occurrence wins.
    pub buckets: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Buffers sorted ascending, duplicates removed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffers: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continue_training: Option<bool>,
}

impl TemplateParams {
    /// Collect the parameters of `spec`.
    pub fn from_spec(spec: &JobSpec) -> Self {
        let mut seen = BTreeSet::new();
        let buckets = spec
            .buckets
            .iter()
            .filter(|b| seen.insert(b.as_str()))
            .cloned()
            .collect();

        let mut params = Self {
            data_root: spec.data_root_param(),
            buckets,
            address: None,
            port: None,
            buffers: None,
            buffer: None,
            threshold: None,
            continue_training: None,
        };

        match &spec.workload {
            Workload::Serving => {
                params.address = Some(spec.address.clone());
                params.port = Some(spec.port);
                params.buffers = Some(sorted_buffers(spec));
            }
            Workload::TrainEnsemble => params.buffers = Some(sorted_buffers(spec)),
            Workload::TrainModel { buffer } => {
                params.buffer = Some(buffer.clone());
                params.threshold = spec.threshold;
                params.continue_training = Some(spec.continue_training);
            }
        }

        params
    }
}

fn sorted_buffers(spec: &JobSpec) -> Vec<String> {
    spec.buffers
        .iter()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Render the worker source for `spec`.
///
/// Pure: validates the spec and returns the rendered bytes without touching
/// the filesystem.
pub fn render(spec: &JobSpec) -> Result<Vec<u8>, SupervisorError> {
    spec.validate()?;

    let template = spec
        .custom_template()
        .unwrap_or_else(|| default_template(&spec.workload));

    render_template(template, &TemplateParams::from_spec(spec))
}

/// Render `template` with `params`.
pub fn render_template(template: &str, params: &TemplateParams) -> Result<Vec<u8>, SupervisorError> {
    let mut registry = Handlebars::new();
    registry.set_strict_mode(true);
    registry.register_escape_fn(handlebars::no_escape);

    let text = registry.render_template(template, params)?;
    Ok(text.into_bytes())
}
