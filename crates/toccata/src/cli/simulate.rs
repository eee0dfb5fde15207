use crate::config::Config;
use anyhow::{bail, Context, Result};
use clap::Args;
use std::{fs, path::PathBuf};

use toccata_core::platform::{MoveKind, MoveProvider, MoveRequest};
use toccata_core::queue::MoveQueue;
use toccata_core::{AXES, DRIVES};
use toccata_gcode::{MetaAction, MetaProcessor, NullObjectModel};

#[derive(Args)]
pub struct SimulateArgs {
    /// Path to the machine configuration file (TOML or JSON).
    pub config: PathBuf,

    /// Path to the job file to simulate.
    pub job: PathBuf,
}

impl SimulateArgs {
    pub fn run(&self) -> Result<()> {
        tracing_subscriber::fmt::init();

        let config = Config::from_file(&self.config)?;
        config.validate()?;

        let source = fs::read_to_string(&self.job)
            .with_context(|| format!("failed to read job file {}", self.job.display()))?;

        let mut platform = config.platform();
        let mut queue = MoveQueue::new(config.kinematics(), &mut platform);
        queue.set_idle_timeout(config.idle_timeout);
        queue.simulate(true);

        tracing::info!(
            "simulating {} on a {} machine",
            self.job.display(),
            queue.geometry_name()
        );

        let model = NullObjectModel;
        let mut job = JobMoves::new(&source, &model);

        let mut ticks = 0u64;
        while !(job.finished() && queue.ring_empty()) {
            queue.spin(&mut platform, &mut job);
            platform.advance(0.001);
            ticks += 1;
            if ticks > 10_000_000 {
                bail!("simulation failed to converge");
            }
        }

        if let Some(message) = job.abort_message() {
            println!("job aborted: {}", message);
        }
        println!(
            "{} moves, estimated print time {:.1} s",
            job.moves_issued(),
            queue.simulation_time()
        );
        Ok(())
    }
}

/// A minimal job-file front-end for simulation: runs the conditional
/// meta-commands and turns `G0`/`G1` lines into move requests. The real
/// front-end lives outside the motion core.
struct JobMoves<'m> {
    lines: Vec<String>,
    pc: usize,
    processor: MetaProcessor<'m>,
    position: [f64; AXES],
    feed_rate: f64,
    moves_issued: u64,
    aborted: Option<String>,
    failed: bool,
}

impl<'m> JobMoves<'m> {
    fn new(source: &str, model: &'m NullObjectModel) -> Self {
        Self {
            lines: source.lines().map(|line| line.to_string()).collect(),
            pc: 0,
            processor: MetaProcessor::new(model),
            position: [0.0; AXES],
            feed_rate: 50.0,
            moves_issued: 0,
            aborted: None,
            failed: false,
        }
    }

    fn finished(&self) -> bool {
        self.failed || self.aborted.is_some() || self.pc >= self.lines.len()
    }

    fn moves_issued(&self) -> u64 {
        self.moves_issued
    }

    fn abort_message(&self) -> Option<&str> {
        self.aborted.as_deref()
    }

    // Parse a G0/G1 line into a move request. Axis words are absolute,
    // extruder words relative, F is mm/min.
    fn parse_move(&mut self, line: &str, file_position: u64) -> Option<MoveRequest> {
        let mut words = line.split_whitespace();
        match words.next() {
            Some("G0") | Some("G1") => {}
            _ => return None,
        }

        let mut coords = [0.0; DRIVES];
        coords[..AXES].copy_from_slice(&self.position);
        let mut any_motion = false;
        for word in words {
            if !word.is_ascii() {
                continue;
            }
            let (letter, number) = word.split_at(1);
            let value: f64 = match number.parse() {
                Ok(v) => v,
                Err(_) => continue,
            };
            match letter {
                "X" => {
                    coords[0] = value;
                    any_motion = true;
                }
                "Y" => {
                    coords[1] = value;
                    any_motion = true;
                }
                "Z" => {
                    coords[2] = value;
                    any_motion = true;
                }
                "E" => {
                    coords[3] = value;
                    any_motion = true;
                }
                "F" => self.feed_rate = value / 60.0,
                _ => {}
            }
        }
        if !any_motion {
            return None;
        }

        self.position.copy_from_slice(&coords[..AXES]);
        self.moves_issued += 1;
        Some(MoveRequest {
            coords,
            feed_rate: self.feed_rate,
            endstop_checks: 0,
            kind: MoveKind::Normal,
            file_position: Some(file_position),
        })
    }
}

impl MoveProvider for JobMoves<'_> {
    fn read_move(&mut self) -> Option<MoveRequest> {
        loop {
            if self.failed || self.aborted.is_some() {
                return None;
            }
            if self.pc >= self.lines.len() {
                // Unwind any loop still open at end of file.
                match self.processor.end_of_file() {
                    Some(MetaAction::Rewind { file_position, .. }) => {
                        self.pc = file_position as usize;
                        continue;
                    }
                    _ => return None,
                }
            }

            let line = self.lines[self.pc].clone();
            let line_number = self.pc as u32 + 1;
            let file_position = self.pc as u64;
            match self
                .processor
                .process_line(&line, line_number, file_position)
            {
                Ok(MetaAction::Command) => {
                    self.pc += 1;
                    if let Some(request) = self.parse_move(&line, file_position) {
                        return Some(request);
                    }
                }
                Ok(MetaAction::Skipped) => self.pc += 1,
                Ok(MetaAction::Echo(text)) => {
                    println!("echo: {}", text);
                    self.pc += 1;
                }
                Ok(MetaAction::Rewind { file_position, .. }) => {
                    self.pc = file_position as usize;
                }
                Ok(MetaAction::Abort(message)) => {
                    self.aborted = Some(message.unwrap_or_default());
                    return None;
                }
                Err(err) => {
                    tracing::error!("job file error: {}", err);
                    self.failed = true;
                    return None;
                }
            }
        }
    }

    fn set_axis_is_homed(&mut self, _axis: usize) {}

    fn is_paused(&self) -> bool {
        false
    }
}
