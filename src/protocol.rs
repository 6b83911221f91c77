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

//! Line protocol used while waiting for the prompt

use std::io::{self, BufRead, Read};

/// Line feed - terminates every line
pub const LF: u8 = b'\n';

/// Carriage return - dropped when it directly precedes LF
pub const CR: u8 = b'\r';

/// Longest line accepted from the device, terminator excluded
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Reads the next line from `reader` into `line`.
///
/// Returns `Ok(None)` at end of stream. The terminator (`\n` or `\r\n`) is
/// stripped; an unterminated final line is still returned. A line longer than
/// [`MAX_LINE_LEN`] fails with `InvalidData`.
pub fn read_line<'a, R: BufRead>(reader: &mut R, line: &'a mut Vec<u8>) -> io::Result<Option<&'a [u8]>> {
    line.clear();
    // One extra byte for the terminator, one more to detect overflow.
    let limit = (MAX_LINE_LEN + 2) as u64;
    let n = reader.by_ref().take(limit).read_until(LF, line)?;
    if n == 0 {
        return Ok(None);
    }

    if line.last() == Some(&LF) {
        line.pop();
        if line.last() == Some(&CR) {
            line.pop();
        }
    }

    if line.len() > MAX_LINE_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("line exceeds {} bytes", MAX_LINE_LEN),
        ));
    }

    Ok(Some(line.as_slice()))
}

// ============================================================================
// Tests
// ============================================================================
