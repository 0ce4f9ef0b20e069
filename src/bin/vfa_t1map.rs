//! vfa-t1map — command-line VFA T1 mapping.
//!
//! Computes a T1 map from 2+ spoiled GRE NIfTI volumes acquired at
//! different flip angles. TR and flip angles are taken from the command
//! line or inferred from Bruker-style method files adjacent to each image.
//! Exactly two volumes use the closed-form solver; three or more use the
//! least-squares fit.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use log::{info, warn};

use vfa_core::error::VfaError;
use vfa_core::fit::{fit_multi_point, fit_two_point, FitOptions, T1FitResult};
use vfa_core::method::{default_adjacent_method_path, read_method_file};
use vfa_core::nifti_io::{read_volume_file, write_volume_file, Volume};
use vfa_core::params::{resolve_parameters, AcquisitionParams, InferenceKeys, TrUnit};
use vfa_core::utils::build_auto_mask;

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "vfa-t1map")]
#[command(
    about = "Compute a VFA T1 map from 2+ spoiled GRE NIfTI volumes, with optional Bruker method-file parameter parsing"
)]
#[command(version)]
struct Cli {
    /// NIfTI images at different flip angles (2 or more), in order.
    #[arg(long, num_args = 2.., required = true)]
    imgs: Vec<PathBuf>,

    /// Output T1 map (.nii or .nii.gz), in seconds, saved as float32.
    #[arg(long)]
    out: PathBuf,

    /// Optional output path for the validity mask (1 = voxel fitted).
    #[arg(long)]
    out_valid: Option<PathBuf>,

    /// Flip angles in degrees, same count and order as --imgs.
    #[arg(long, num_args = 1..)]
    fas: Option<Vec<f64>>,

    /// TR value (optional if parsed from method files).
    #[arg(long)]
    tr: Option<f64>,

    /// Units for --tr when given manually.
    #[arg(long, value_enum, default_value_t = TrUnitsArg::S)]
    tr_units: TrUnitsArg,

    /// Explicit method files, same count and order as --imgs. Defaults to
    /// the adjacent <image>.method path.
    #[arg(long, num_args = 1..)]
    methods: Option<Vec<PathBuf>>,

    /// Require independently parsed TR values to agree.
    #[arg(long)]
    require_same_tr: bool,

    /// Binary mask NIfTI (nonzero = fit this voxel).
    #[arg(long)]
    mask: Option<PathBuf>,

    /// Derive an intensity mask when no --mask is given.
    #[arg(long)]
    auto_mask: bool,

    /// Auto-mask threshold as a fraction of the 95th percentile.
    #[arg(long, default_value_t = 0.05)]
    auto_mask_frac: f64,

    /// Lower clamp for the fitted E1.
    #[arg(long, default_value_t = 1e-6)]
    e1_min: f64,

    /// Upper clamp for the fitted E1.
    #[arg(long, default_value_t = 0.999999)]
    e1_max: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TrUnitsArg {
    S,
    Ms,
}

impl From<TrUnitsArg> for TrUnit {
    fn from(u: TrUnitsArg) -> Self {
        match u {
            TrUnitsArg::S => TrUnit::Seconds,
            TrUnitsArg::Ms => TrUnit::Milliseconds,
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(e) = run(Cli::parse()) {
        eprintln!("ERROR: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> CliResult<()> {
    let n = cli.imgs.len();

    let manual_fas: Vec<Option<f64>> = match &cli.fas {
        Some(fas) => {
            if fas.len() != n {
                return Err(format!(
                    "--fas count ({}) must match --imgs count ({n})",
                    fas.len()
                )
                .into());
            }
            fas.iter().map(|&f| Some(f)).collect()
        }
        None => vec![None; n],
    };

    if let Some(methods) = &cli.methods {
        if methods.len() != n {
            return Err(format!(
                "--methods count ({}) must match --imgs count ({n})",
                methods.len()
            )
            .into());
        }
    }

    // Load signal volumes; the first image is the spatial reference.
    let mut vols: Vec<Volume> = Vec::with_capacity(n);
    for path in &cli.imgs {
        let vol = read_volume_file(path)?;
        info!(
            "loaded {} ({}x{}x{})",
            path.display(),
            vol.dims.0,
            vol.dims.1,
            vol.dims.2
        );
        if let Some(first) = vols.first() {
            if vol.dims != first.dims {
                return Err(format!(
                    "shape mismatch: {} is {:?}, expected {:?}",
                    path.display(),
                    vol.dims,
                    first.dims
                )
                .into());
            }
        }
        vols.push(vol);
    }
    let reference = &vols[0];

    let mask: Option<Vec<u8>> = if let Some(mask_path) = &cli.mask {
        let mvol = read_volume_file(mask_path)?;
        if mvol.dims != reference.dims {
            return Err(format!(
                "mask shape mismatch: {:?} vs images {:?}",
                mvol.dims, reference.dims
            )
            .into());
        }
        Some(mvol.data.iter().map(|&v| (v != 0.0) as u8).collect())
    } else if cli.auto_mask {
        let data: Vec<&[f64]> = vols.iter().map(|v| v.data.as_slice()).collect();
        Some(build_auto_mask(&data, cli.auto_mask_frac))
    } else {
        None
    };

    // Method texts are only read when something still needs inferring.
    let need_tr = cli.tr.is_none();
    let need_fa = manual_fas.iter().any(Option::is_none);
    let mut method_texts: Vec<Option<String>> = vec![None; n];
    if need_tr || need_fa {
        for i in 0..n {
            let mpath = match &cli.methods {
                Some(methods) => methods[i].clone(),
                None => default_adjacent_method_path(&cli.imgs[i]),
            };
            match read_method_file(&mpath) {
                Ok(text) => method_texts[i] = Some(text),
                Err(VfaError::ResourceNotFound(p)) => {
                    warn!("[method {i}] not found: {}", p.display());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    let params = resolve_parameters(
        cli.tr,
        cli.tr_units.into(),
        &manual_fas,
        &method_texts,
        &InferenceKeys::default(),
        cli.require_same_tr,
    )?;

    let opts = FitOptions {
        e1_min: cli.e1_min,
        e1_max: cli.e1_max,
        ..FitOptions::default()
    };

    let result: T1FitResult = if n == 2 {
        fit_two_point(
            &vols[0].data,
            &vols[1].data,
            params.flip_angles_deg[0],
            params.flip_angles_deg[1],
            params.tr_s,
            mask.as_deref(),
            &opts,
        )?
    } else {
        let data: Vec<&[f64]> = vols.iter().map(|v| v.data.as_slice()).collect();
        fit_multi_point(
            &data,
            &params.flip_angles_deg,
            params.tr_s,
            mask.as_deref(),
            &opts,
        )?
    };

    write_volume_file(
        &cli.out,
        &result.t1,
        reference.dims,
        reference.voxel_size,
        &reference.affine,
    )?;

    if let Some(valid_path) = &cli.out_valid {
        let valid_f64: Vec<f64> = result.valid.iter().map(|&v| v as f64).collect();
        write_volume_file(
            valid_path,
            &valid_f64,
            reference.dims,
            reference.voxel_size,
            &reference.affine,
        )?;
    }

    print_report(&cli, &params);
    Ok(())
}

fn print_report(cli: &Cli, params: &AcquisitionParams) {
    println!("=== VFA T1 mapping ({}-point) ===", cli.imgs.len());
    println!("TR  : {} s ({})", params.tr_s, params.tr_provenance);
    let fas = params
        .flip_angles_deg
        .iter()
        .zip(params.fa_provenance.iter())
        .map(|(fa, prov)| format!("{fa} ({prov})"))
        .collect::<Vec<_>>()
        .join(", ");
    println!("FAs : {fas} deg");
    println!("Imgs: {}", cli.imgs.len());
    println!("Out : {}", cli.out.display());
    if let Some(valid) = &cli.out_valid {
        println!("Val : {}", valid.display());
    }
    if let Some(mask) = &cli.mask {
        println!("Mask: {}", mask.display());
    } else if cli.auto_mask {
        println!("Mask: auto (frac={})", cli.auto_mask_frac);
    } else {
        println!("Mask: none");
    }
    if !params.notes.is_empty() {
        println!("--- method parsing ---");
        for note in &params.notes {
            println!("{note}");
        }
    }
    println!("Done.");
}
