//! ACF container parsing.
//!
//! A container is a flat sequence of chunks, each an 8-byte space-padded
//! ASCII tag plus a little-endian 32-bit payload size. Video chunks carry
//! key or delta frames for the tile codec; the rest install format and
//! palette state, describe frame lengths, record camera moves, or pad the
//! stream for CD sector alignment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, ensure};
use byteorder::{ByteOrder, LittleEndian};
use memmap2::Mmap;

use crate::codec::{DecodeStatus, FrameDecoder};
use crate::vue::CameraRecord;

pub const PALETTE_SIZE: usize = 768;

const CHUNK_HEADER_LEN: usize = 12;
const FORMAT_RECORD_LEN: usize = 44;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkKind {
    End,
    FrameLen,
    Format,
    Palette,
    NulChunk,
    KeyFrame,
    DltFrame,
    Recouvre,
    Camera,
    SoundBuf,
    SoundFrm,
    SoundEnd,
    SalStart,
    SalPart,
    SalEnd,
    SalComp,
    Unknown,
}

fn chunk_kind(tag: &[u8; 8]) -> ChunkKind {
    match tag {
        b"NulChunk" => ChunkKind::NulChunk,
        b"KeyFrame" => ChunkKind::KeyFrame,
        b"DltFrame" => ChunkKind::DltFrame,
        b"FrameLen" => ChunkKind::FrameLen,
        b"Format  " => ChunkKind::Format,
        b"Palette " => ChunkKind::Palette,
        b"SoundBuf" => ChunkKind::SoundBuf,
        b"SoundFrm" => ChunkKind::SoundFrm,
        b"SoundEnd" => ChunkKind::SoundEnd,
        b"SAL_STRT" => ChunkKind::SalStart,
        b"SAL_PART" => ChunkKind::SalPart,
        b"SAL_END " => ChunkKind::SalEnd,
        b"SAL_COMP" => ChunkKind::SalComp,
        b"Recouvre" => ChunkKind::Recouvre,
        b"Camera  " => ChunkKind::Camera,
        b"End     " => ChunkKind::End,
        _ => ChunkKind::Unknown,
    }
}

fn tag_name(tag: &[u8; 8]) -> String {
    String::from_utf8_lossy(tag).trim_end().to_string()
}

/// Video stream description from the `Format  ` chunk.
#[derive(Debug, Clone, Copy)]
pub struct AcfFormat {
    pub record_size: u32,
    pub width: u32,
    pub height: u32,
    pub frame_size: u32,
    pub key_size: u32,
    pub key_rate: u32,
    pub play_rate: u32,
    pub sampling_rate: u32,
    pub sample_type: u32,
    pub sample_flags: u32,
    /// 0 is the tile codec decoded here; 1 is a related variant that the
    /// decoder reads literally but flags as degraded.
    pub compressor: u32,
}

impl AcfFormat {
    fn parse(payload: &[u8]) -> Result<Self> {
        ensure!(
            payload.len() >= FORMAT_RECORD_LEN,
            "format chunk holds {} bytes, expected at least {FORMAT_RECORD_LEN}",
            payload.len()
        );
        let field = |index: usize| LittleEndian::read_u32(&payload[index * 4..index * 4 + 4]);
        let format = Self {
            record_size: field(0),
            width: field(1),
            height: field(2),
            frame_size: field(3),
            key_size: field(4),
            key_rate: field(5),
            play_rate: field(6),
            sampling_rate: field(7),
            sample_type: field(8),
            sample_flags: field(9),
            compressor: field(10),
        };
        ensure!(
            format.width > 0 && format.height > 0,
            "format chunk reports zero width or height"
        );
        ensure!(
            format.width % 8 == 0 && format.height % 8 == 0,
            "frame dimensions {}x{} are not 8x8 tile aligned",
            format.width,
            format.height
        );
        Ok(format)
    }

    pub fn tiles_per_frame(&self) -> u32 {
        (self.width / 8) * (self.height / 8)
    }
}

/// The active 256-entry RGB palette, replaced wholesale by palette chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Palette {
    data: [u8; PALETTE_SIZE],
}

impl Palette {
    fn from_chunk(payload: &[u8]) -> Result<Self> {
        ensure!(
            payload.len() >= PALETTE_SIZE,
            "palette chunk holds {} bytes, expected {PALETTE_SIZE}",
            payload.len()
        );
        let mut data = [0u8; PALETTE_SIZE];
        data.copy_from_slice(&payload[..PALETTE_SIZE]);
        Ok(Self { data })
    }

    pub fn as_bytes(&self) -> &[u8; PALETTE_SIZE] {
        &self.data
    }

    /// RGB triplet for one palette index.
    pub fn rgb(&self, index: u8) -> [u8; 3] {
        let base = index as usize * 3;
        [self.data[base], self.data[base + 1], self.data[base + 2]]
    }
}

impl Default for Palette {
    fn default() -> Self {
        Self {
            data: [0; PALETTE_SIZE],
        }
    }
}

/// Per-frame sector counts from the `FrameLen` chunk; informational only.
#[derive(Debug, Clone)]
pub struct FrameLenInfo {
    pub biggest_frame_size: u32,
    pub sectors: Vec<u8>,
}

impl FrameLenInfo {
    fn parse(payload: &[u8]) -> Result<Self> {
        ensure!(
            payload.len() >= 4,
            "frame length chunk holds {} bytes, expected at least 4",
            payload.len()
        );
        Ok(Self {
            biggest_frame_size: LittleEndian::read_u32(&payload[..4]),
            sectors: payload[4..].to_vec(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Key,
    Delta,
}

/// Borrowed view of a decoded frame, handed to the per-frame sink.
pub struct AcfFrameView<'a> {
    pub index: u32,
    pub kind: FrameKind,
    pub width: u32,
    pub height: u32,
    pub pixels: &'a [u8],
    pub palette: &'a Palette,
    pub status: DecodeStatus,
}

/// Everything learned from one walk over a container.
#[derive(Debug, Default)]
pub struct AcfSummary {
    pub format: Option<AcfFormat>,
    pub frame_len: Option<FrameLenInfo>,
    pub frames: u32,
    pub degraded_frames: u32,
    pub failed_frames: u32,
    pub cameras: Vec<(u32, CameraRecord)>,
    pub chunk_counts: BTreeMap<String, usize>,
    pub end_seen: bool,
}

/// Walks the container, decoding video chunks in place and feeding each
/// completed frame to `on_frame`. Memory stays bounded by the two frame
/// buffers regardless of how many frames the container holds.
pub fn parse_acf<F>(bytes: &[u8], mut on_frame: F) -> Result<AcfSummary>
where
    F: FnMut(&AcfFrameView<'_>) -> Result<()>,
{
    let mut summary = AcfSummary::default();
    let mut decoder: Option<FrameDecoder> = None;
    let mut palette = Palette::default();
    let mut offset = 0usize;

    while offset + CHUNK_HEADER_LEN <= bytes.len() {
        let tag: [u8; 8] = bytes[offset..offset + 8].try_into().unwrap();
        let size = LittleEndian::read_u32(&bytes[offset + 8..offset + 12]) as usize;
        let payload_start = offset + CHUNK_HEADER_LEN;
        ensure!(
            size <= bytes.len() - payload_start,
            "chunk '{}' claims {size} bytes but only {} remain",
            tag_name(&tag),
            bytes.len() - payload_start
        );
        let payload = &bytes[payload_start..payload_start + size];
        let kind = chunk_kind(&tag);
        *summary.chunk_counts.entry(tag_name(&tag)).or_insert(0) += 1;

        match kind {
            ChunkKind::End => {
                summary.end_seen = true;
                break;
            }
            ChunkKind::Format => {
                let format = AcfFormat::parse(payload).context("parsing format chunk")?;
                if format.compressor != 0 {
                    eprintln!(
                        "[acf_formats] warning: compressor variant {} is not the primary codec; frames will be flagged degraded",
                        format.compressor
                    );
                }
                match decoder.as_mut() {
                    Some(existing) => existing.reconfigure(format.width, format.height)?,
                    None => decoder = Some(FrameDecoder::new(format.width, format.height)?),
                }
                summary.format = Some(format);
            }
            ChunkKind::Palette => {
                palette = Palette::from_chunk(payload).context("parsing palette chunk")?;
            }
            ChunkKind::FrameLen => {
                summary.frame_len =
                    Some(FrameLenInfo::parse(payload).context("parsing frame length chunk")?);
            }
            ChunkKind::Camera => {
                let camera = CameraRecord::parse(payload).context("parsing camera chunk")?;
                summary.cameras.push((summary.frames, camera));
            }
            ChunkKind::KeyFrame | ChunkKind::DltFrame => {
                match (decoder.as_mut(), summary.format) {
                    (Some(decoder), Some(format)) => {
                        let outcome = decoder.decode(payload);
                        let status = if format.compressor != 0 {
                            DecodeStatus::Degraded
                        } else {
                            outcome.status
                        };
                        if status == DecodeStatus::Degraded {
                            summary.degraded_frames += 1;
                        }
                        let view = AcfFrameView {
                            index: summary.frames,
                            kind: if kind == ChunkKind::KeyFrame {
                                FrameKind::Key
                            } else {
                                FrameKind::Delta
                            },
                            width: format.width,
                            height: format.height,
                            pixels: decoder.last_frame(),
                            palette: &palette,
                            status,
                        };
                        on_frame(&view)?;
                        summary.frames += 1;
                    }
                    _ => {
                        eprintln!(
                            "[acf_formats] warning: video chunk before any format chunk, skipping frame"
                        );
                        summary.failed_frames += 1;
                    }
                }
            }
            ChunkKind::Unknown => {
                eprintln!(
                    "[acf_formats] warning: skipping unknown chunk '{}' ({size} bytes)",
                    tag_name(&tag)
                );
            }
            // Padding, audio and subtitle chunks carry no video state.
            _ => {}
        }

        offset = payload_start + size;
    }

    Ok(summary)
}

/// Memory-maps a container file for parsing.
pub fn map_input(path: &Path) -> Result<Mmap> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open ACF file {}", path.display()))?;
    let mmap = unsafe { Mmap::map(&file) }
        .with_context(|| format!("memory-mapping {}", path.display()))?;
    Ok(mmap)
}

/// One decoded frame with its palette, as collected by [`AcfFile`].
#[derive(Clone, Debug)]
pub struct AcfFrame {
    pub index: u32,
    pub kind: FrameKind,
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
    pub palette: Palette,
    pub status: DecodeStatus,
}

/// Parsed representation of a whole container with every frame decoded.
#[derive(Debug)]
pub struct AcfFile {
    pub source: Option<PathBuf>,
    pub summary: AcfSummary,
    pub frames: Vec<AcfFrame>,
}

impl AcfFile {
    /// Parse an ACF file from disk.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = map_input(path)?;
        let mut parsed = Self::read_from(&bytes)
            .with_context(|| format!("parsing ACF container {}", path.display()))?;
        parsed.source = Some(path.to_path_buf());
        Ok(parsed)
    }

    /// Parse an ACF container from an in-memory byte buffer.
    pub fn read_from(bytes: &[u8]) -> Result<Self> {
        let mut frames = Vec::new();
        let summary = parse_acf(bytes, |frame| {
            frames.push(AcfFrame {
                index: frame.index,
                kind: frame.kind,
                width: frame.width,
                height: frame.height,
                pixels: frame.pixels.to_vec(),
                palette: frame.palette.clone(),
                status: frame.status,
            });
            Ok(())
        })?;
        Ok(Self {
            source: None,
            summary,
            frames,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(tag: &[u8; 8], payload: &[u8]) -> Vec<u8> {
        let mut out = tag.to_vec();
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn format_chunk(width: u32, height: u32, compressor: u32) -> Vec<u8> {
        let fields = [
            FORMAT_RECORD_LEN as u32,
            width,
            height,
            0,
            0,
            12,
            12,
            22050,
            0,
            0,
            compressor,
        ];
        let payload: Vec<u8> = fields.iter().flat_map(|f| f.to_le_bytes()).collect();
        chunk(b"Format  ", &payload)
    }

    fn palette_chunk(seed: u8) -> Vec<u8> {
        let payload: Vec<u8> = (0..PALETTE_SIZE)
            .map(|i| (i as u8).wrapping_add(seed))
            .collect();
        chunk(b"Palette ", &payload)
    }

    fn frame_payload(width: usize, height: usize, ops: &[u8], aligned: &[u8]) -> Vec<u8> {
        let opcode_area = (height / 8) * ((width / 8 * 6 + 7) / 8);
        let mut opcodes = Vec::new();
        for group in ops.chunks(4) {
            let mut value = 0u32;
            for (i, &op) in group.iter().enumerate() {
                value |= ((op & 63) as u32) << (6 * i);
            }
            opcodes.extend_from_slice(&value.to_le_bytes()[..3]);
        }
        opcodes.resize(opcode_area, 0);
        let mut payload = ((4 + opcode_area + aligned.len()) as u32)
            .to_le_bytes()
            .to_vec();
        payload.extend_from_slice(&opcodes);
        payload.extend_from_slice(aligned);
        payload
    }

    fn raw_key_frame(width: usize, height: usize, pattern: &[u8]) -> Vec<u8> {
        let tiles = (width / 8) * (height / 8);
        chunk(
            b"KeyFrame",
            &frame_payload(width, height, &vec![0u8; tiles], pattern),
        )
    }

    #[test]
    fn header_only_container_emits_no_frames() {
        let mut bytes = format_chunk(320, 200, 0);
        bytes.extend_from_slice(&palette_chunk(0));
        bytes.extend_from_slice(&chunk(b"End     ", &[]));

        let file = AcfFile::read_from(&bytes).unwrap();
        assert!(file.frames.is_empty());
        assert!(file.summary.end_seen);
        let format = file.summary.format.unwrap();
        assert_eq!(format.width, 320);
        assert_eq!(format.height, 200);
        assert_eq!(format.tiles_per_frame(), 1000);
        assert_eq!(file.summary.chunk_counts["Format"], 1);
        assert_eq!(file.summary.chunk_counts["Palette"], 1);
    }

    #[test]
    fn raw_key_frame_then_zero_motion_delta() {
        let pattern: Vec<u8> = (0..128).map(|i| (i ^ 0x5A) as u8).collect();
        let mut bytes = format_chunk(16, 8, 0);
        bytes.extend_from_slice(&palette_chunk(0));
        bytes.extend_from_slice(&raw_key_frame(16, 8, &pattern));
        bytes.extend_from_slice(&chunk(b"DltFrame", &frame_payload(16, 8, &[1, 1], &[])));
        bytes.extend_from_slice(&chunk(b"End     ", &[]));

        let file = AcfFile::read_from(&bytes).unwrap();
        assert_eq!(file.frames.len(), 2);
        assert_eq!(file.frames[0].kind, FrameKind::Key);
        assert_eq!(file.frames[1].kind, FrameKind::Delta);
        assert_eq!(file.frames[0].status, DecodeStatus::Clean);
        assert_eq!(file.frames[0].pixels.len(), 128);
        assert_eq!(file.frames[0].pixels, file.frames[1].pixels);
        assert_eq!(file.summary.frames, 2);
        assert_eq!(file.summary.degraded_frames, 0);
    }

    #[test]
    fn palette_change_leaves_pixels_untouched() {
        let pattern: Vec<u8> = (0..128).map(|i| i as u8).collect();
        let mut bytes = format_chunk(16, 8, 0);
        bytes.extend_from_slice(&palette_chunk(1));
        bytes.extend_from_slice(&raw_key_frame(16, 8, &pattern));
        bytes.extend_from_slice(&palette_chunk(99));
        bytes.extend_from_slice(&raw_key_frame(16, 8, &pattern));

        let file = AcfFile::read_from(&bytes).unwrap();
        assert_eq!(file.frames.len(), 2);
        assert_eq!(file.frames[0].pixels, file.frames[1].pixels);
        assert_ne!(file.frames[0].palette, file.frames[1].palette);
        assert_eq!(file.frames[1].palette.as_bytes()[0], 99);
        assert_eq!(file.frames[1].palette.rgb(1), [102, 103, 104]);
    }

    #[test]
    fn truncated_chunk_is_an_error() {
        let mut bytes = format_chunk(16, 8, 0);
        bytes.extend_from_slice(b"KeyFrame");
        bytes.extend_from_slice(&1000u32.to_le_bytes());
        bytes.extend_from_slice(&[0; 8]);

        let err = AcfFile::read_from(&bytes).unwrap_err();
        assert!(err.to_string().contains("KeyFrame"));
    }

    #[test]
    fn unknown_and_padding_chunks_are_skipped() {
        let mut bytes = format_chunk(16, 8, 0);
        bytes.extend_from_slice(&chunk(b"NulChunk", &[0; 64]));
        bytes.extend_from_slice(&chunk(b"SoundBuf", &[1; 32]));
        bytes.extend_from_slice(&chunk(b"SAL_STRT", &[2; 16]));
        bytes.extend_from_slice(&chunk(b"Mystery!", &[3; 8]));
        bytes.extend_from_slice(&chunk(b"End     ", &[]));

        let file = AcfFile::read_from(&bytes).unwrap();
        assert!(file.frames.is_empty());
        assert_eq!(file.summary.chunk_counts["Mystery!"], 1);
        assert_eq!(file.summary.chunk_counts["SoundBuf"], 1);
    }

    #[test]
    fn missing_end_chunk_is_tolerated() {
        let bytes = format_chunk(16, 8, 0);
        let file = AcfFile::read_from(&bytes).unwrap();
        assert!(!file.summary.end_seen);
        assert!(file.summary.format.is_some());
    }

    #[test]
    fn frame_before_format_counts_as_failure() {
        let mut bytes = raw_key_frame(16, 8, &[0; 128]);
        bytes.extend_from_slice(&chunk(b"End     ", &[]));

        let file = AcfFile::read_from(&bytes).unwrap();
        assert!(file.frames.is_empty());
        assert_eq!(file.summary.failed_frames, 1);
        assert_eq!(file.summary.frames, 0);
    }

    #[test]
    fn camera_records_carry_the_current_frame_index() {
        let pattern: Vec<u8> = vec![0; 128];
        let camera_fields: Vec<u8> = [5i32, 6, 7, 8, 9, 10, 0, 500]
            .iter()
            .flat_map(|f| f.to_le_bytes())
            .collect();
        let mut bytes = format_chunk(16, 8, 0);
        bytes.extend_from_slice(&raw_key_frame(16, 8, &pattern));
        bytes.extend_from_slice(&chunk(b"Camera  ", &camera_fields));
        bytes.extend_from_slice(&raw_key_frame(16, 8, &pattern));

        let file = AcfFile::read_from(&bytes).unwrap();
        assert_eq!(file.summary.cameras.len(), 1);
        let (frame, camera) = file.summary.cameras[0];
        assert_eq!(frame, 1);
        assert_eq!(camera.cam_x, 5);
        assert_eq!(camera.cam_z, 6);
        assert_eq!(camera.cam_y, 7);
    }

    #[test]
    fn dimension_change_reallocates_buffers() {
        let mut bytes = format_chunk(16, 8, 0);
        bytes.extend_from_slice(&raw_key_frame(16, 8, &[7; 128]));
        bytes.extend_from_slice(&format_chunk(24, 8, 0));
        bytes.extend_from_slice(&raw_key_frame(24, 8, &[9; 192]));

        let file = AcfFile::read_from(&bytes).unwrap();
        assert_eq!(file.frames.len(), 2);
        assert_eq!(file.frames[0].pixels.len(), 128);
        assert_eq!(file.frames[1].width, 24);
        assert_eq!(file.frames[1].pixels.len(), 192);
        assert!(file.frames[1].pixels.iter().all(|&b| b == 9));
    }

    #[test]
    fn nonzero_compressor_flags_frames_degraded() {
        let mut bytes = format_chunk(16, 8, 1);
        bytes.extend_from_slice(&raw_key_frame(16, 8, &[1; 128]));

        let file = AcfFile::read_from(&bytes).unwrap();
        assert_eq!(file.frames.len(), 1);
        assert_eq!(file.frames[0].status, DecodeStatus::Degraded);
        assert_eq!(file.summary.degraded_frames, 1);
    }

    #[test]
    fn frame_length_info_is_captured() {
        let mut payload = 4096u32.to_le_bytes().to_vec();
        payload.extend_from_slice(&[3, 4, 5]);
        let mut bytes = format_chunk(16, 8, 0);
        bytes.extend_from_slice(&chunk(b"FrameLen", &payload));

        let file = AcfFile::read_from(&bytes).unwrap();
        let info = file.summary.frame_len.unwrap();
        assert_eq!(info.biggest_frame_size, 4096);
        assert_eq!(info.sectors, vec![3, 4, 5]);
    }

    #[test]
    fn bad_format_chunk_is_an_error() {
        let bytes = format_chunk(20, 8, 0); // width not tile aligned
        assert!(AcfFile::read_from(&bytes).is_err());
    }
}
