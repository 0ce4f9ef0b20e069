//! End-to-end tests: method text -> resolved parameters -> mask -> T1 map.

mod common;

use common::{max_rel_err, rmse, spgr_signal};

use vfa_core::error::VfaError;
use vfa_core::fit::{e1_to_t1, fit_multi_point, fit_two_point, FitOptions};
use vfa_core::params::{resolve_parameters, InferenceKeys, Provenance, TrUnit};
use vfa_core::utils::build_auto_mask;

/// Build a synthetic phantom: a bright foreground block with known E1/K and
/// a zero background, imaged at the given flip angles.
fn make_phantom(
    n_total: usize,
    n_fg: usize,
    e1_fg: f64,
    k_fg: f64,
    fas: &[f64],
) -> (Vec<Vec<f64>>, Vec<u8>) {
    let mut vols = vec![vec![0.0; n_total]; fas.len()];
    let mut fg = vec![0u8; n_total];
    for v in 0..n_fg {
        fg[v] = 1;
        for (j, &fa) in fas.iter().enumerate() {
            vols[j][v] = spgr_signal(k_fg, e1_fg, fa);
        }
    }
    (vols, fg)
}

#[test]
fn two_point_pipeline_with_method_inference() {
    // TR in ms and flip angles split across a scalar key and a pulse tuple,
    // the way Bruker method files actually arrive.
    let method1 = "##$PVM_RepetitionTime=15\n##$PVM_FlipAngle=5\n".to_string();
    let method2 =
        "##$PVM_RepetitionTime=15\n##$ExcPulse1=(1, 6000,\n  15, Yes, 4)\n".to_string();

    let params = resolve_parameters(
        None,
        TrUnit::Seconds,
        &[None, None],
        &[Some(method1), Some(method2)],
        &InferenceKeys::default(),
        true,
    )
    .unwrap();

    assert!((params.tr_s - 0.015).abs() < 1e-12);
    assert_eq!(params.flip_angles_deg, vec![5.0, 15.0]);
    assert_eq!(
        params.tr_provenance,
        Provenance::Parsed { source: 0, key: "PVM_RepetitionTime".to_string() }
    );

    let e1_true = 0.86;
    let (vols, fg) = make_phantom(512, 64, e1_true, 900.0, &params.flip_angles_deg);
    let mask = build_auto_mask(&vols, 0.05);
    // The auto mask keeps exactly the bright block.
    assert_eq!(mask, fg);

    let res = fit_two_point(
        &vols[0],
        &vols[1],
        params.flip_angles_deg[0],
        params.flip_angles_deg[1],
        params.tr_s,
        Some(&mask),
        &FitOptions::default(),
    )
    .unwrap();

    let t1_true = -params.tr_s / e1_true.ln();
    for v in 0..512 {
        if fg[v] == 1 {
            assert_eq!(res.valid[v], 1);
            assert!((res.t1[v] - t1_true).abs() / t1_true < 1e-9);
        } else {
            assert_eq!(res.valid[v], 0);
            assert_eq!(res.t1[v], 0.0);
        }
    }
}

#[test]
fn multi_point_recovers_spatially_varying_t1() {
    let fas = [3.0, 8.0, 15.0, 25.0];
    let tr = 0.012;
    let n = 256;

    let mut vols = vec![Vec::with_capacity(n); fas.len()];
    let mut t1_true = Vec::with_capacity(n);
    for i in 0..n {
        let e1 = 0.40 + 0.5 * (i as f64 / n as f64);
        let k = 700.0 + i as f64;
        t1_true.push(-tr / e1.ln());
        for (j, &fa) in fas.iter().enumerate() {
            vols[j].push(spgr_signal(k, e1, fa));
        }
    }

    let res = fit_multi_point(&vols, &fas, tr, None, &FitOptions::default()).unwrap();
    let all = vec![1u8; n];
    assert!(res.valid.iter().all(|&v| v == 1));
    assert!(max_rel_err(&res.t1, &t1_true, &all) < 1e-4);
    assert!(rmse(&res.t1, &t1_true, &all) < 1e-6);
}

#[test]
fn multi_point_matches_two_point_on_masked_grid() {
    let fas = [6.0, 18.0];
    let tr = 0.02;
    let n = 128;

    let mut s1 = Vec::with_capacity(n);
    let mut s2 = Vec::with_capacity(n);
    let mut mask = vec![0u8; n];
    for i in 0..n {
        let e1 = 0.5 + 0.004 * (i % 100) as f64;
        s1.push(spgr_signal(1000.0, e1, fas[0]));
        s2.push(spgr_signal(1000.0, e1, fas[1]));
        mask[i] = (i % 3 != 0) as u8;
    }

    let two = fit_two_point(&s1, &s2, fas[0], fas[1], tr, Some(&mask), &FitOptions::default())
        .unwrap();
    let vols = [s1, s2];
    let multi = fit_multi_point(&vols, &fas, tr, Some(&mask), &FitOptions::default()).unwrap();

    assert_eq!(two.valid, multi.valid);
    assert!(rmse(&two.t1, &multi.t1, &mask) < 1e-9);
    for v in 0..n {
        if mask[v] == 0 {
            assert_eq!(two.t1[v], 0.0);
            assert_eq!(multi.t1[v], 0.0);
        }
    }
}

#[test]
fn reference_scenario_s100_s300() {
    // S1=100 at 5 deg, S2=300 at 15 deg, TR=0.015 s, no mask.
    let tr = 0.015;
    let res =
        fit_two_point(&[100.0], &[300.0], 5.0, 15.0, tr, None, &FitOptions::default()).unwrap();

    let (a1, a2) = (5.0_f64.to_radians(), 15.0_f64.to_radians());
    let raw = (300.0 / a2.sin() - 100.0 / a1.sin()) / (300.0 / a2.tan() - 100.0 / a1.tan());
    let e1_ref = raw.clamp(1e-6, 0.999999);
    let t1_ref = -tr / e1_ref.ln();

    assert_eq!(res.valid[0], 1);
    assert!(res.t1[0].is_finite() && res.t1[0] > 0.0);
    assert!((res.t1[0] - t1_ref).abs() / t1_ref < 1e-9);

    // The standalone conversion agrees with the fitted map.
    let t1_map = e1_to_t1(&res.e1, tr, 0.0);
    assert!((t1_map[0] - res.t1[0]).abs() < 1e-15);
}

#[test]
fn missing_parameters_report_full_trail() {
    // One method text lacks any flip angle key; the other slot has no text
    // at all. The failure must name both gaps and keep every note.
    let method1 = "##$PVM_RepetitionTime=15\n".to_string();
    let err = resolve_parameters(
        None,
        TrUnit::Seconds,
        &[None, None],
        &[Some(method1), None],
        &InferenceKeys::default(),
        false,
    )
    .unwrap_err();

    match err {
        VfaError::MissingParameters { missing, notes } => {
            assert_eq!(missing, vec!["fa1".to_string(), "fa2".to_string()]);
            assert_eq!(notes.len(), 2);
            assert!(notes[0].contains("TR inferred from PVM_RepetitionTime"));
            assert!(notes[0].contains("flip angle not found"));
            assert!(notes[1].contains("no method text provided"));
        }
        other => panic!("expected MissingParameters, got {other:?}"),
    }
}
