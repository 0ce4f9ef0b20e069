//! Acquisition parameter inference and resolution.
//!
//! TR and flip angles are either supplied manually or inferred from parsed
//! method stores using ordered candidate-key lists. Manual values always win
//! and suppress inference for that parameter. Every inference attempt leaves
//! a diagnostic note so failures can report the full trail.

use std::fmt;

use crate::error::VfaError;
use crate::method::{extract_first_number, extract_tuple_angle, MethodStore};

/// Units for a manually supplied TR value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrUnit {
    #[default]
    Seconds,
    Milliseconds,
}

impl TrUnit {
    pub fn to_seconds(self, value: f64) -> f64 {
        match self {
            TrUnit::Seconds => value,
            TrUnit::Milliseconds => value / 1000.0,
        }
    }
}

/// Ordered candidate key lists driving parameter inference.
///
/// Kept as data rather than hard-coded branches so site-specific method
/// dialects can extend the search order.
#[derive(Debug, Clone)]
pub struct InferenceKeys {
    /// Keys tried for TR, in priority order.
    pub tr_keys: Vec<String>,
    /// Scalar-valued flip angle keys, tried first.
    pub fa_scalar_keys: Vec<String>,
    /// Pulse-tuple keys, tried when no scalar key yields a valid angle.
    pub fa_tuple_keys: Vec<String>,
    /// Zero-based tuple field holding the flip angle (third field by
    /// convention).
    pub fa_tuple_field: usize,
}

impl Default for InferenceKeys {
    fn default() -> Self {
        InferenceKeys {
            tr_keys: ["PVM_RepetitionTime", "RepetitionTime", "PVM_TR", "TR"]
                .map(String::from)
                .to_vec(),
            fa_scalar_keys: [
                "PVM_FlipAngle",
                "FlipAngle",
                "PVM_ExcPulseAngle",
                "PVM_ExcPulAngle",
                "PVM_ExcFlipAngle",
                "PVM_ExFlipAngle",
            ]
            .map(String::from)
            .to_vec(),
            fa_tuple_keys: [
                "ExcPulse1",
                "ExcPulse2",
                "ExcPulse",
                "PVM_ExcPulse1",
                "PVM_ExcPulse2",
                "PVM_ExcPulse",
            ]
            .map(String::from)
            .to_vec(),
            fa_tuple_field: 2,
        }
    }
}

/// Where a resolved parameter value came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provenance {
    Manual,
    /// Parsed from the method source at `source` under `key`.
    Parsed { source: usize, key: String },
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provenance::Manual => write!(f, "manual"),
            Provenance::Parsed { key, .. } => write!(f, "parsed:{key}"),
        }
    }
}

/// A value inferred from a method store, with the key that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Inferred {
    pub value: f64,
    pub key: String,
}

/// Fully resolved acquisition parameters, immutable after resolution.
#[derive(Debug, Clone)]
pub struct AcquisitionParams {
    /// Repetition time in seconds, strictly positive.
    pub tr_s: f64,
    pub tr_provenance: Provenance,
    /// One flip angle in degrees per signal volume, each strictly in
    /// (0, 180).
    pub flip_angles_deg: Vec<f64>,
    pub fa_provenance: Vec<Provenance>,
    /// Diagnostic notes from every inference attempt, in source order.
    pub notes: Vec<String>,
}

/// Infer TR in seconds from a method store.
///
/// Searches `keys.tr_keys` in order and numeric-extracts the first hit.
/// Bruker commonly stores TR in milliseconds, so magnitudes above 0.5 are
/// assumed to be ms and divided by 1000. This threshold is a documented
/// heuristic, not a guaranteed unit detector; callers needing certainty
/// should supply TR manually.
pub fn infer_tr_seconds(store: &MethodStore, keys: &InferenceKeys) -> (Option<Inferred>, String) {
    let hit = keys
        .tr_keys
        .iter()
        .find_map(|k| store.get(k).map(|raw| (k, raw)));

    let (key, raw) = match hit {
        Some(h) => h,
        None => return (None, "TR not found in method".to_string()),
    };

    let tr_val = match extract_first_number(raw) {
        Some(v) => v,
        None => return (None, "TR not found in method".to_string()),
    };

    if tr_val > 0.5 {
        let tr_s = tr_val / 1000.0;
        let note = format!("TR inferred from {key}={tr_val} (assumed ms -> {tr_s} s)");
        (Some(Inferred { value: tr_s, key: key.clone() }), note)
    } else {
        let note = format!("TR inferred from {key}={tr_val} (assumed s)");
        (Some(Inferred { value: tr_val, key: key.clone() }), note)
    }
}

/// Infer a flip angle in degrees from a method store.
///
/// Scalar keys are tried first; a hit must numeric-extract to a value
/// strictly inside (0, 180) or the search continues. If no scalar key
/// yields an acceptable angle, pulse-tuple keys are tried via
/// [`extract_tuple_angle`].
pub fn infer_flip_angle_deg(
    store: &MethodStore,
    keys: &InferenceKeys,
) -> (Option<Inferred>, String) {
    for k in &keys.fa_scalar_keys {
        if let Some(raw) = store.get(k) {
            if let Some(v) = extract_first_number(raw) {
                if v > 0.0 && v < 180.0 {
                    let note = format!("flip angle inferred from {k}={v} (degrees assumed)");
                    return (Some(Inferred { value: v, key: k.clone() }), note);
                }
            }
        }
    }

    for k in &keys.fa_tuple_keys {
        if let Some(raw) = store.get(k) {
            if let Some(v) = extract_tuple_angle(raw, keys.fa_tuple_field) {
                let note = format!(
                    "flip angle inferred from {k} tuple (field {}) = {v} deg",
                    keys.fa_tuple_field
                );
                return (Some(Inferred { value: v, key: k.clone() }), note);
            }
        }
    }

    (
        None,
        "flip angle not found in method (no scalar key and no parsable pulse tuple)".to_string(),
    )
}

/// Same-TR consistency tolerance: relative 1e-6, absolute 1e-9 seconds.
fn tr_close(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 + 1e-6 * b.abs()
}

/// Merge manual overrides with values inferred from method texts.
///
/// `manual_fas` and `method_texts` must have one slot per signal volume.
/// A manual value suppresses inference for that parameter. TR is taken from
/// the first source that yields one; each flip angle slot consults only its
/// own source. With `require_same_tr`, independently inferred TR values must
/// agree pairwise within tolerance (relative 1e-6, absolute 1e-9 s).
///
/// Fails with `MissingParameters` (carrying every diagnostic note) if any
/// required value remains unresolved; missing parameters are never silently
/// defaulted.
pub fn resolve_parameters(
    manual_tr: Option<f64>,
    manual_tr_unit: TrUnit,
    manual_fas: &[Option<f64>],
    method_texts: &[Option<String>],
    keys: &InferenceKeys,
    require_same_tr: bool,
) -> Result<AcquisitionParams, VfaError> {
    let n = manual_fas.len();
    if method_texts.len() != n {
        return Err(VfaError::Config(format!(
            "expected one method source slot per volume: {} flip angle slots vs {} method slots",
            n,
            method_texts.len()
        )));
    }
    if n == 0 {
        return Err(VfaError::Config("at least one signal volume is required".to_string()));
    }

    let manual_tr_s = manual_tr.map(|v| manual_tr_unit.to_seconds(v));
    let need_tr = manual_tr_s.is_none();

    let mut notes: Vec<String> = Vec::new();
    let mut inferred_trs: Vec<(usize, Inferred)> = Vec::new();
    let mut fas: Vec<Option<f64>> = manual_fas.to_vec();
    let mut fa_provenance: Vec<Option<Provenance>> = manual_fas
        .iter()
        .map(|f| f.map(|_| Provenance::Manual))
        .collect();

    for (i, text) in method_texts.iter().enumerate() {
        let need_fa = fas[i].is_none();
        if !need_tr && !need_fa {
            continue;
        }

        let text = match text {
            Some(t) => t,
            None => {
                notes.push(format!("[method {i}] no method text provided"));
                continue;
            }
        };

        let store = MethodStore::parse(text);
        let mut parts: Vec<String> = Vec::new();

        if need_tr {
            let (tr, tr_note) = infer_tr_seconds(&store, keys);
            parts.push(tr_note);
            if let Some(inf) = tr {
                inferred_trs.push((i, inf));
            }
        }

        if need_fa {
            let (fa, fa_note) = infer_flip_angle_deg(&store, keys);
            parts.push(fa_note);
            if let Some(inf) = fa {
                fas[i] = Some(inf.value);
                fa_provenance[i] = Some(Provenance::Parsed { source: i, key: inf.key });
            }
        }

        notes.push(format!("[method {i}] {}", parts.join("; ")));
    }

    if require_same_tr && inferred_trs.len() >= 2 {
        let all_close = inferred_trs
            .iter()
            .all(|(_, a)| inferred_trs.iter().all(|(_, b)| tr_close(a.value, b.value)));
        if !all_close {
            return Err(VfaError::TrMismatch {
                values: inferred_trs
                    .iter()
                    .map(|(i, inf)| (format!("method {i}: {}", inf.key), inf.value))
                    .collect(),
            });
        }
    }

    let (tr_s, tr_provenance) = match manual_tr_s {
        Some(v) => (Some(v), Some(Provenance::Manual)),
        None => match inferred_trs.first() {
            Some((i, inf)) => (
                Some(inf.value),
                Some(Provenance::Parsed { source: *i, key: inf.key.clone() }),
            ),
            None => (None, None),
        },
    };

    let mut missing: Vec<String> = Vec::new();
    for (i, fa) in fas.iter().enumerate() {
        if fa.is_none() {
            missing.push(format!("fa{}", i + 1));
        }
    }
    if tr_s.is_none() {
        missing.push("tr".to_string());
    }
    if !missing.is_empty() {
        return Err(VfaError::MissingParameters { missing, notes });
    }

    let tr_s = tr_s.unwrap();
    if !(tr_s > 0.0) {
        return Err(VfaError::Config(format!("TR must be > 0 seconds; got {tr_s}")));
    }
    let flip_angles_deg: Vec<f64> = fas.into_iter().map(Option::unwrap).collect();
    for (i, &fa) in flip_angles_deg.iter().enumerate() {
        if !(fa > 0.0 && fa < 180.0) {
            return Err(VfaError::Config(format!(
                "flip angle {} must be in (0, 180) degrees; got {fa}",
                i + 1
            )));
        }
    }

    Ok(AcquisitionParams {
        tr_s,
        tr_provenance: tr_provenance.unwrap(),
        flip_angles_deg,
        fa_provenance: fa_provenance.into_iter().map(Option::unwrap).collect(),
        notes,
    })
}
