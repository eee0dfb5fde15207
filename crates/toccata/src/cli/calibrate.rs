use crate::config::Config;
use anyhow::{bail, Context, Result};
use clap::Args;
use std::{fs, path::PathBuf};

use toccata_core::calibration::{self, ProbePoint};

#[derive(Args)]
pub struct CalibrateArgs {
    /// Path to the machine configuration file (TOML or JSON).
    pub config: PathBuf,

    /// Path to a file of probed points, one `x,y,z` triple per line.
    pub probes: PathBuf,
}

impl CalibrateArgs {
    pub fn run(&self) -> Result<()> {
        tracing_subscriber::fmt::init();

        let config = Config::from_file(&self.config)?;
        config.validate()?;

        let kinematics = config.kinematics();
        if !kinematics.is_delta_mode() {
            bail!("auto-calibration requires a delta geometry");
        }
        let mut delta = kinematics.delta;

        let points = read_probe_points(&self.probes)?;
        tracing::info!("calibrating from {} probe points", points.len());

        println!("before: {}", delta.print_parameters(true));
        let deviation = calibration::deviation(&points);

        let adjustment = calibration::solve(&delta, &points)?;
        calibration::apply(&mut delta, &adjustment);

        println!("after:  {}", delta.print_parameters(true));
        println!(
            "{}-factor fit of {} points, deviation before {:.3} mm",
            adjustment.num_factors,
            points.len(),
            deviation
        );
        Ok(())
    }
}

fn read_probe_points(path: &PathBuf) -> Result<Vec<ProbePoint>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read probe file {}", path.display()))?;

    let mut points = Vec::new();
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let mut fields = line.split(',').map(str::trim);
        let point = (|| -> Option<ProbePoint> {
            Some(ProbePoint {
                x: fields.next()?.parse().ok()?,
                y: fields.next()?.parse().ok()?,
                z: fields.next()?.parse().ok()?,
            })
        })()
        .with_context(|| format!("bad probe point on line {}: '{}'", index + 1, line))?;
        points.push(point);
    }
    Ok(points)
}
