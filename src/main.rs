// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

// Prompt-triggered serial upload
mod config;
mod protocol;
mod serial;
mod upload;

use clap::Parser;
use clap::builder::NonEmptyStringValueParser;
use log::{error, info, warn};
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Once};
use config::{Config, DEFAULT_BAUD_RATE, DEFAULT_DATA_BITS, DEFAULT_PARITY, DEFAULT_STOP_BITS};
use serial::{RealSerialPort, SerialPort};

#[derive(Parser)]
#[command(name = "serial-upload")]
#[command(about = "Upload a file over a serial line once the device prints a prompt", long_about = None)]
struct Cli {
    /// File to upload
    #[arg(short, long, value_parser = NonEmptyStringValueParser::new())]
    file: String,

    /// Serial port to use (e.g., /dev/ttyUSB0 or COM1)
    #[arg(short, long, value_parser = NonEmptyStringValueParser::new())]
    device: String,

    /// Baud rate
    #[arg(short, long, default_value_t = DEFAULT_BAUD_RATE)]
    baud: u32,

    /// Data bits (5, 6, 7, or 8)
    #[arg(long, default_value_t = DEFAULT_DATA_BITS, value_name = "BITS")]
    data_bits: u8,

    /// Stop bits (1 or 2)
    #[arg(long, default_value_t = DEFAULT_STOP_BITS, value_name = "BITS")]
    stop_bits: u8,

    /// Parity (N, O, or E); anything else means none
    #[arg(long, default_value = DEFAULT_PARITY)]
    parity: String,

    /// Line to wait for before sending the file
    #[arg(short, long, value_parser = NonEmptyStringValueParser::new())]
    prompt: String,

    /// Keep running after the upload; without --echo, upload again on every prompt
    #[arg(long)]
    linger: bool,

    /// While lingering, echo serial output to stdout
    #[arg(long, requires = "linger")]
    echo: bool,

    /// Enable debug output
    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn into_config(self) -> Config {
        Config {
            file: PathBuf::from(self.file),
            device: self.device,
            baud_rate: self.baud,
            data_bits: self.data_bits,
            stop_bits: self.stop_bits,
            parity: self.parity,
            prompt: self.prompt,
            linger: self.linger,
            echo: self.echo,
        }
    }
}

fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

/// Closes `port` on the first Ctrl-C, which makes the blocked upload fail
fn close_on_interrupt(port: Arc<dyn SerialPort>) -> Result<(), ctrlc::Error> {
    let once = Once::new();
    ctrlc::set_handler(move || {
        once.call_once(|| {
            info!("Caught interrupt, closing serial port");
            if let Err(e) = port.close() {
                warn!("Failed to close serial port: {}", e);
            }
        });
    })
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);
    let config = cli.into_config();

    info!("Opening serial port: {}", config.device);
    info!("Settings: {}", config.mode());

    let port: Arc<dyn SerialPort> = match RealSerialPort::open(&config.device) {
        Ok(port) => Arc::new(port),
        Err(e) => {
            error!("Failed to open serial port: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = close_on_interrupt(port.clone()) {
        error!("Failed to install interrupt handler: {}", e);
        std::process::exit(1);
    }

    info!("Uploading file: {}", config.file.display());
    let result = upload::upload(&config, port.clone(), io::stdout());

    if let Err(e) = port.close() {
        warn!("Failed to close serial port: {}", e);
    }

    if let Err(e) = result {
        error!("Upload failed: {}", e);
        std::process::exit(1);
    }
}
