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

use std::path::PathBuf;
use crate::serial::{Mode, Parity};

pub const DEFAULT_BAUD_RATE: u32 = 115200;
pub const DEFAULT_DATA_BITS: u8 = 8;
pub const DEFAULT_STOP_BITS: u8 = 1;
pub const DEFAULT_PARITY: &str = "N";

/// Settings for one upload session. Built once, then only read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// File sent each time the prompt is seen
    pub file: PathBuf,
    /// Device the port was opened from; only used for reporting
    pub device: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    /// Parity selector: `N`, `O` or `E`
    pub parity: String,
    /// Exact line that triggers the transfer
    pub prompt: String,
    /// Keep going after the first transfer instead of returning
    pub linger: bool,
    /// While lingering, copy everything the device sends to the echo sink
    pub echo: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            file: PathBuf::new(),
            device: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: DEFAULT_DATA_BITS,
            stop_bits: DEFAULT_STOP_BITS,
            parity: DEFAULT_PARITY.to_string(),
            prompt: String::new(),
            linger: false,
            echo: false,
        }
    }
}

impl Config {
    pub fn mode(&self) -> Mode {
        Mode {
            baud_rate: self.baud_rate,
            data_bits: self.data_bits,
            stop_bits: self.stop_bits,
            parity: Parity::from_selector(&self.parity),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.mode(), Mode {
            baud_rate: 115200,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
        });
        assert!(!config.linger);
        assert!(!config.echo);
    }

    #[test]
    fn test_mode_maps_parity_selector() {
        let config = Config {
            baud_rate: 9600,
            data_bits: 7,
            stop_bits: 2,
            parity: "E".to_string(),
            ..Config::default()
        };
        assert_eq!(config.mode(), Mode {
            baud_rate: 9600,
            data_bits: 7,
            stop_bits: 2,
            parity: Parity::Even,
        });

        let config = Config { parity: "X".to_string(), ..Config::default() };
        assert_eq!(config.mode().parity, Parity::None);
    }
}
