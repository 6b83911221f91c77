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

use std::marker::PhantomData;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;
use log::{debug, info};
use thiserror::Error;
use crate::config::Config;
use crate::protocol::read_line;
use crate::serial::{Mode, PortError, PortIo, SerialPort};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("failed to set serial port mode: {0}")]
    ModeConfiguration(#[source] PortError),

    #[error("prompt {0:?} not found")]
    PromptNotFound(String),

    #[error("error reading from serial port (in state: {state}): {source}")]
    TransportRead {
        state: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to write file to serial port: {0}")]
    TransportWrite(#[source] io::Error),

    #[error("failed to echo serial output: {0}")]
    EchoWrite(#[source] io::Error),

    #[error("failed to open file {}: {source}", .path.display())]
    FilePayload {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Transfer complete")]
    TransferComplete,
}

// ============================================================================
// States
// ============================================================================

pub struct Configuring;
pub struct WaitingForPrompt;
pub struct Transferring;
pub struct Lingering;

// ============================================================================
// FSM Structure
// ============================================================================

pub struct UploadFsm<State> {
    state: PhantomData<State>,
    port: Arc<dyn SerialPort>,
    // Shared by every state so nothing read past a prompt line is dropped
    reader: BufReader<PortIo>,
    line: Vec<u8>,
    mode: Mode,
    file: PathBuf,
    prompt: String,
    linger: bool,
    echo: Option<Box<dyn Write + Send>>,
    announced: bool,
    uploads: usize,
}

// ============================================================================
// Trait
// ============================================================================

pub trait UploadState: Send {
    fn step(self: Box<Self>) -> Result<Box<dyn UploadState>, UploadError>;
}

// ============================================================================
// Helper to transition states
// ============================================================================

impl<S> UploadFsm<S> {
    fn transition<T>(self) -> Box<UploadFsm<T>> {
        Box::new(UploadFsm {
            state: PhantomData,
            port: self.port,
            reader: self.reader,
            line: self.line,
            mode: self.mode,
            file: self.file,
            prompt: self.prompt,
            linger: self.linger,
            echo: self.echo,
            announced: self.announced,
            uploads: self.uploads,
        })
    }

    fn read_error(&self, e: io::Error) -> UploadError {
        let type_name = std::any::type_name::<S>();
        let state_name = type_name.split("::").last().unwrap_or(type_name);
        UploadError::TransportRead {
            state: state_name,
            source: e,
        }
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl UploadState for UploadFsm<Configuring> {
    fn step(self: Box<Self>) -> Result<Box<dyn UploadState>, UploadError> {
        let fsm = *self;
        fsm.port.set_mode(&fsm.mode).map_err(UploadError::ModeConfiguration)?;
        debug!("Mode set: {}", fsm.mode);
        let next = fsm.transition::<WaitingForPrompt>();
        Ok(next as Box<dyn UploadState>)
    }
}

impl UploadState for UploadFsm<WaitingForPrompt> {
    fn step(self: Box<Self>) -> Result<Box<dyn UploadState>, UploadError> {
        let mut fsm = *self;
        if !fsm.announced {
            info!("Waiting for prompt {:?}", fsm.prompt);
            fsm.announced = true;
        }

        let matched = match read_line(&mut fsm.reader, &mut fsm.line) {
            Ok(Some(line)) => {
                debug!("> {:?}", String::from_utf8_lossy(line));
                Some(line == fsm.prompt.as_bytes())
            }
            Ok(None) => None,
            Err(e) => return Err(fsm.read_error(e)),
        };

        match matched {
            Some(true) => {
                info!("Prompt received, sending file");
                let next = fsm.transition::<Transferring>();
                Ok(next as Box<dyn UploadState>)
            }
            Some(false) => Ok(Box::new(fsm) as Box<dyn UploadState>),
            // Lingering without echo ends when the device goes away
            None if fsm.uploads > 0 => {
                info!("Port closed after {} upload(s)", fsm.uploads);
                Err(UploadError::TransferComplete)
            }
            None => Err(UploadError::PromptNotFound(fsm.prompt)),
        }
    }
}

impl UploadState for UploadFsm<Transferring> {
    fn step(self: Box<Self>) -> Result<Box<dyn UploadState>, UploadError> {
        let mut fsm = *self;

        let sent = {
            let mut file = File::open(&fsm.file).map_err(|source| UploadError::FilePayload {
                path: fsm.file.clone(),
                source,
            })?;
            io::copy(&mut file, fsm.reader.get_mut()).map_err(UploadError::TransportWrite)?
        };
        fsm.uploads += 1;
        info!("File sent ({} bytes)", sent);

        if !fsm.linger {
            info!("Done");
            return Err(UploadError::TransferComplete);
        }

        info!("Lingering...");
        fsm.announced = false;
        if fsm.echo.is_some() {
            let next = fsm.transition::<Lingering>();
            Ok(next as Box<dyn UploadState>)
        } else {
            let next = fsm.transition::<WaitingForPrompt>();
            Ok(next as Box<dyn UploadState>)
        }
    }
}

impl UploadState for UploadFsm<Lingering> {
    fn step(self: Box<Self>) -> Result<Box<dyn UploadState>, UploadError> {
        let mut fsm = *self;
        let Some(mut sink) = fsm.echo.take() else {
            let next = fsm.transition::<WaitingForPrompt>();
            return Ok(next as Box<dyn UploadState>);
        };

        let mut echoed = 0;
        loop {
            let n = {
                let chunk = match fsm.reader.fill_buf() {
                    Ok(chunk) => chunk,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(fsm.read_error(e)),
                };
                if chunk.is_empty() {
                    break;
                }
                // Flushed per chunk so partial lines (shell prompts) show up.
                sink.write_all(chunk)
                    .and_then(|()| sink.flush())
                    .map_err(UploadError::EchoWrite)?;
                chunk.len()
            };
            fsm.reader.consume(n);
            echoed += n;
        }

        info!("Port closed, echoed {} bytes", echoed);
        Err(UploadError::TransferComplete)
    }
}

// ============================================================================
// Constructor & Runner
// ============================================================================

impl UploadFsm<Configuring> {
    pub fn new<W>(config: &Config, port: Arc<dyn SerialPort>, output: W) -> Box<dyn UploadState>
    where
        W: Write + Send + 'static,
    {
        let echo: Option<Box<dyn Write + Send>> = if config.echo {
            Some(Box::new(output))
        } else {
            None
        };

        Box::new(UploadFsm {
            state: PhantomData::<Configuring>,
            port: port.clone(),
            reader: BufReader::new(PortIo::new(port)),
            line: Vec::new(),
            mode: config.mode(),
            file: config.file.clone(),
            prompt: config.prompt.clone(),
            linger: config.linger,
            echo,
            announced: false,
            uploads: 0,
        })
    }
}

/// Waits for the prompt on `port` and sends the configured file.
///
/// `output` receives everything read from the port while lingering, but only
/// when `config.echo` is set. The port is never closed here; closing it from
/// another thread makes a blocked call fail and this function return that
/// failure.
pub fn upload<W>(config: &Config, port: Arc<dyn SerialPort>, output: W) -> Result<(), UploadError>
where
    W: Write + Send + 'static,
{
    let mut state = UploadFsm::<Configuring>::new(config, port, output);

    loop {
        match state.step() {
            Ok(next_state) => {
                state = next_state;
            }
            Err(UploadError::TransferComplete) => {
                return Ok(());
            }
            Err(e) => {
                return Err(e);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
