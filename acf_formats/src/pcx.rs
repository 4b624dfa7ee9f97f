//! PCX sink for decoded frames.
//!
//! Writes version-5 8-bit indexed PCX images: a 128-byte header, per-row
//! run-length encoding, then the 0x0C marker and the 768-byte palette.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result, ensure};
use byteorder::{ByteOrder, LittleEndian};

use crate::acf::Palette;

const HEADER_LEN: usize = 128;
const RUN_MARKER: u8 = 0xC0;
const MAX_RUN: usize = 63;

/// Encodes one frame as a PCX image into `out`.
pub fn write_pcx<W: Write>(
    out: &mut W,
    width: u32,
    height: u32,
    pixels: &[u8],
    palette: &Palette,
) -> Result<()> {
    ensure!(width > 0 && height > 0, "image dimensions must be nonzero");
    let (w, h) = (width as usize, height as usize);
    ensure!(
        pixels.len() >= w * h,
        "pixel buffer holds {} bytes, expected {}",
        pixels.len(),
        w * h
    );

    out.write_all(&header(width, height))?;
    for row in pixels[..w * h].chunks_exact(w) {
        write_row(out, row)?;
    }
    out.write_all(&[0x0C])?;
    out.write_all(palette.as_bytes())?;
    Ok(())
}

/// Writes one frame as a PCX file at `path`.
pub fn save_pcx(
    path: impl AsRef<Path>,
    width: u32,
    height: u32,
    pixels: &[u8],
    palette: &Palette,
) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    write_pcx(&mut writer, width, height, pixels, palette)
        .with_context(|| format!("encoding {}", path.display()))?;
    writer
        .flush()
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

fn header(width: u32, height: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0] = 10; // manufacturer
    header[1] = 5; // version
    header[2] = 1; // RLE encoding
    header[3] = 8; // bits per pixel
    // xmin/ymin stay zero
    LittleEndian::write_u16(&mut header[8..10], (width - 1) as u16); // xmax
    LittleEndian::write_u16(&mut header[10..12], (height - 1) as u16); // ymax
    LittleEndian::write_u16(&mut header[12..14], width as u16); // horizontal dpi
    LittleEndian::write_u16(&mut header[14..16], height as u16); // vertical dpi
    header[65] = 1; // planes
    LittleEndian::write_u16(&mut header[66..68], width as u16); // bytes per line
    header
}

// Runs cap at 63 pixels and never cross a row boundary. A lone byte whose
// top two bits are set must still be written as a run of one, or the reader
// would take it for a run marker.
fn write_row<W: Write>(out: &mut W, row: &[u8]) -> Result<()> {
    let mut index = 0;
    while index < row.len() {
        let byte = row[index];
        let mut run = 1;
        while run < MAX_RUN && index + run < row.len() && row[index + run] == byte {
            run += 1;
        }
        if run > 1 || byte & RUN_MARKER == RUN_MARKER {
            out.write_all(&[RUN_MARKER | run as u8, byte])?;
        } else {
            out.write_all(&[byte])?;
        }
        index += run;
    }
    Ok(())
}
