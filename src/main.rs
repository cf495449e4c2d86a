// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use tempest_rx::config::Capture;
use tempest_rx::events::TracingSink;
use tempest_rx::frontend;
use tempest_rx::pipeline::Pipeline;
use tempest_rx::sync::NoSync;

#[derive(Parser)]
#[clap(
    author = "Michael Wilson",
    version = "0.3.0",
    about = "Reconstructs video from the stray emissions of a monitor."
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lists the available radio front ends.
    Frontends {},
    /// Starts a capture session from a configuration file.
    Start {
        /// The path to the capture config.
        config_path: String,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Frontends {} => {
            let frontends = frontend::list_frontends();

            if frontends.is_empty() {
                println!("No front ends found.");
                return Ok(());
            }

            println!("Front ends:");
            for frontend in frontends {
                println!("- {}", frontend);
            }
        }
        Commands::Start { config_path } => {
            let config = Capture::load(&PathBuf::from(config_path))?;
            let frontend = frontend::get_frontend(config.frontend())?;

            let (pipeline, frames) =
                Pipeline::start(&config, frontend, Box::new(NoSync), Arc::new(TracingSink))?;

            let mut count: u64 = 0;
            for frame in frames.iter() {
                count += 1;
                if count % 60 == 0 {
                    info!(
                        frames = count,
                        width = frame.width,
                        height = frame.height,
                        "Reconstruction running."
                    );
                }
            }

            drop(pipeline);
        }
    }

    Ok(())
}
