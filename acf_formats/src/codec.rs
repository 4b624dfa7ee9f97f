//! Tile codec for ACF video frames.
//!
//! A frame payload carries one 6-bit opcode per 8x8 tile plus two data
//! streams sharing the payload buffer: an "aligned" stream that follows the
//! opcode array and an "unaligned" stream starting at the `color_offset`
//! recorded in the payload's first four bytes. Each opcode rebuilds one tile
//! from flat fills, bit-packed palette indices, palette-bank packings, or a
//! motion-compensated copy out of the previous frame, optionally followed by
//! a small pixel-patch overlay. Key frames and delta frames run through the
//! same decoder.

use anyhow::{Context, Result, ensure};

// Traversal orders used by the run-to-mask block opcodes. The two diagonal
// tables are anti-diagonal zig-zags expressed as linear offsets for a
// 320-pixel stride, kept exactly as the streams were authored against.
const DIAGONAL_OFFSETS_1: [usize; 64] = [
    0, 1, 320, 640, 321, 2, 3, 322, 641, 960, 1280, 961, 642, 323, 4, 5, 324, 643, 962, 1281,
    1600, 1920, 1601, 1282, 963, 644, 325, 6, 7, 326, 645, 964, 1283, 1602, 1921, 2240, 2241,
    1922, 1603, 1284, 965, 646, 327, 647, 966, 1285, 1604, 1923, 2242, 2243, 1924, 1605, 1286,
    967, 1287, 1606, 1925, 2244, 2245, 1926, 1607, 1927, 2246, 2247,
];

const DIAGONAL_OFFSETS_2: [usize; 64] = [
    7, 6, 327, 647, 326, 5, 4, 325, 646, 967, 1287, 966, 645, 324, 3, 2, 323, 644, 965, 1286,
    1607, 1927, 1606, 1285, 964, 643, 322, 1, 0, 321, 642, 963, 1284, 1605, 1926, 2247, 2246,
    1925, 1604, 1283, 962, 641, 320, 640, 961, 1282, 1603, 1924, 2245, 2244, 1923, 1602, 1281,
    960, 1280, 1601, 1922, 2243, 2242, 1921, 1600, 1920, 2241, 2240,
];

/// Whether a decoded frame stayed within its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// Every stream cursor ended inside the payload.
    Clean,
    /// A cursor left the payload; the frame was still produced
    /// deterministically from zero-filled reads.
    Degraded,
}

/// Result of decoding one frame payload.
#[derive(Debug, Clone, Copy)]
pub struct FrameOutcome {
    pub status: DecodeStatus,
    /// Tiles reconstructed, always `(width/8) * (height/8)`.
    pub tiles: usize,
    /// Final aligned-stream position relative to the payload start.
    pub aligned_end: usize,
    /// Final unaligned-stream position relative to the payload start.
    pub unaligned_end: usize,
}

/// Byte cursor over a frame payload.
///
/// Reads past the end of the slice yield zeroes while the position keeps
/// advancing, so a malformed stream decodes deterministically and the
/// overrun is visible in the final position.
struct StreamCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> StreamCursor<'a> {
    fn new(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn overran(&self) -> bool {
        self.pos > self.data.len()
    }

    fn peek(&self, ahead: usize) -> u8 {
        self.data.get(self.pos + ahead).copied().unwrap_or(0)
    }

    fn skip(&mut self, count: usize) {
        self.pos += count;
    }

    fn read_byte(&mut self) -> u8 {
        let value = self.peek(0);
        self.pos += 1;
        value
    }

    fn read_u16(&mut self) -> u16 {
        let value = u16::from_le_bytes([self.peek(0), self.peek(1)]);
        self.pos += 2;
        value
    }

    fn read_i16(&mut self) -> i16 {
        self.read_u16() as i16
    }

    fn peek_u32(&self, ahead: usize) -> u32 {
        u32::from_le_bytes([
            self.peek(ahead),
            self.peek(ahead + 1),
            self.peek(ahead + 2),
            self.peek(ahead + 3),
        ])
    }

    /// Reads a 32-bit word but advances by `advance` bytes; packed 24-bit
    /// values advance 3 and discard the high byte downstream.
    fn read_u32(&mut self, advance: usize) -> u32 {
        let value = self.peek_u32(0);
        self.pos += advance;
        value
    }

    /// Two signed bytes packing a pixel displacement; the vertical step is
    /// encoded in half-row units of the given stride.
    fn read_xy_offset(&mut self, stride: usize) -> i16 {
        let dx = self.read_byte() as i8;
        let dy = self.read_byte() as i8;
        (dx as i32 + dy as i32 * stride as i32 / 2) as i16
    }
}

/// Sign-extends the two 4-bit components of a short motion byte.
fn nibble_motion(value: u8) -> (isize, isize) {
    let dx = ((value as i32 & 15) << 28) >> 28;
    let dy = ((value as i32) << 24) >> 28;
    (dx as isize, dy as isize)
}

/// Nibble reader for the bank-1 block opcodes. The bank's own byte carries
/// the first color in its high nibble; after that, colors alternate
/// low-then-high nibble per byte. A half-consumed trailing byte is skipped
/// when the tile completes.
struct BankNibbles {
    pending: bool,
}

impl BankNibbles {
    fn new() -> Self {
        Self { pending: true }
    }

    fn next(&mut self, unaligned: &mut StreamCursor<'_>) -> u8 {
        if self.pending {
            self.pending = false;
            unaligned.read_byte() >> 4
        } else {
            self.pending = true;
            unaligned.peek(0) & 15
        }
    }

    fn finish(self, unaligned: &mut StreamCursor<'_>) {
        if self.pending {
            unaligned.skip(1);
        }
    }
}

/// Traversal orders shared by the block and bank-1 block opcodes.
#[derive(Clone, Copy)]
enum Traversal {
    Horizontal,
    Vertical,
    Diagonal1,
    Diagonal2,
}

/// Double-buffered decoder for ACF frame payloads.
pub struct FrameDecoder {
    width: usize,
    height: usize,
    current: Vec<u8>,
    previous: Vec<u8>,
    tile: usize,
}

impl FrameDecoder {
    pub fn new(width: u32, height: u32) -> Result<Self> {
        let mut decoder = Self {
            width: 0,
            height: 0,
            current: Vec::new(),
            previous: Vec::new(),
            tile: 0,
        };
        decoder.reconfigure(width, height)?;
        Ok(decoder)
    }

    /// Reallocates both frame buffers for a new surface size and zero-fills
    /// them, as required whenever a format record (re)arrives.
    pub fn reconfigure(&mut self, width: u32, height: u32) -> Result<()> {
        ensure!(
            width > 0 && height > 0,
            "frame dimensions {width}x{height} must be nonzero"
        );
        ensure!(
            width % 8 == 0 && height % 8 == 0,
            "frame dimensions {width}x{height} are not 8x8 tile aligned"
        );
        self.width = width as usize;
        self.height = height as usize;
        let size = self
            .width
            .checked_mul(self.height)
            .context("frame buffer size overflow")?;
        self.current = vec![0u8; size];
        self.previous = vec![0u8; size];
        self.tile = 0;
        Ok(())
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    /// The most recently decoded frame.
    pub fn last_frame(&self) -> &[u8] {
        &self.previous
    }

    /// Decodes one frame payload into the working buffer, swaps the buffer
    /// roles, and reports where the stream cursors ended up. The produced
    /// frame is always deterministic; overruns only downgrade the status.
    pub fn decode(&mut self, payload: &[u8]) -> FrameOutcome {
        let rows = self.height / 8;
        let cols = self.width / 8;
        // The opcode array sits after the color offset field; the aligned
        // stream starts right past it, the unaligned stream wherever the
        // color offset points.
        let opcode_area = rows * ((cols * 6 + 7) / 8);
        let color_offset = u32::from_le_bytes([
            payload.first().copied().unwrap_or(0),
            payload.get(1).copied().unwrap_or(0),
            payload.get(2).copied().unwrap_or(0),
            payload.get(3).copied().unwrap_or(0),
        ]) as usize;

        let mut degraded = payload.len() < 4 || color_offset > payload.len();
        let mut opcodes = StreamCursor::new(payload, 4);
        let mut aligned = StreamCursor::new(payload, 4 + opcode_area);
        let mut unaligned = StreamCursor::new(payload, color_offset.min(payload.len()));

        self.tile = 0;
        let mut tiles = 0usize;
        // 24 bits of packed opcodes live in a signed register; -1 doubles as
        // the refill sentinel because the refill forces the top byte to 0xFF
        // and the arithmetic right shifts drag those ones down.
        let mut codes: i32 = -1;
        for _ in 0..rows {
            for _ in 0..cols {
                if codes == -1 {
                    codes = i32::from_le_bytes([
                        opcodes.read_byte(),
                        opcodes.read_byte(),
                        opcodes.read_byte(),
                        0xFF,
                    ]);
                }
                self.dispatch((codes & 63) as u8, &mut aligned, &mut unaligned);
                codes >>= 6;
                self.tile += 8;
                tiles += 1;
            }
            self.tile += self.width * 7;
        }

        if opcodes.overran() || aligned.overran() || unaligned.overran() {
            degraded = true;
        }
        let outcome = FrameOutcome {
            status: if degraded {
                DecodeStatus::Degraded
            } else {
                DecodeStatus::Clean
            },
            tiles,
            aligned_end: aligned.pos(),
            unaligned_end: unaligned.pos(),
        };
        std::mem::swap(&mut self.current, &mut self.previous);
        outcome
    }

    fn dispatch(&mut self, op: u8, aligned: &mut StreamCursor<'_>, unaligned: &mut StreamCursor<'_>) {
        match op {
            0 => self.raw_tile(aligned),

            1 => self.zero_motion(),
            2 => {
                self.zero_motion();
                self.update4(aligned, unaligned);
            }
            3 => {
                self.zero_motion();
                self.update8(aligned, unaligned);
            }
            4 => {
                self.zero_motion();
                self.update16(aligned, unaligned);
            }

            5 => self.short_motion8(unaligned),
            6 => {
                self.short_motion8(unaligned);
                self.update4(aligned, unaligned);
            }
            7 => {
                self.short_motion8(unaligned);
                self.update8(aligned, unaligned);
            }
            8 => {
                self.short_motion8(unaligned);
                self.update16(aligned, unaligned);
            }

            9 => self.motion8(unaligned),
            10 => {
                self.motion8(unaligned);
                self.update4(aligned, unaligned);
            }
            11 => {
                self.motion8(unaligned);
                self.update8(aligned, unaligned);
            }
            12 => {
                self.motion8(unaligned);
                self.update16(aligned, unaligned);
            }

            13 => self.short_motion4(aligned),
            14 => {
                self.short_motion4(aligned);
                self.update4(aligned, unaligned);
            }
            15 => {
                self.short_motion4(aligned);
                self.update8(aligned, unaligned);
            }
            16 => {
                self.short_motion4(aligned);
                self.update16(aligned, unaligned);
            }

            17 => self.motion4(aligned),
            18 => {
                self.motion4(aligned);
                self.update4(aligned, unaligned);
            }
            19 => {
                self.motion4(aligned);
                self.update8(aligned, unaligned);
            }
            20 => {
                self.motion4(aligned);
                self.update16(aligned, unaligned);
            }

            21 => self.single_color_fill(unaligned),
            22 => {
                self.single_color_fill(unaligned);
                self.update4(aligned, unaligned);
            }
            23 => {
                self.single_color_fill(unaligned);
                self.update8(aligned, unaligned);
            }
            24 => {
                self.single_color_fill(unaligned);
                self.update16(aligned, unaligned);
            }

            25 => self.four_color_fill(aligned),
            26 => {
                self.four_color_fill(aligned);
                self.update4(aligned, unaligned);
            }
            27 => {
                self.four_color_fill(aligned);
                self.update8(aligned, unaligned);
            }
            28 => {
                self.four_color_fill(aligned);
                self.update16(aligned, unaligned);
            }

            29 => self.one_bit_tile(aligned, unaligned),
            30 => self.two_bit_tile(aligned),
            31 => self.three_bit_tile(aligned, unaligned),
            32 => self.four_bit_tile(aligned, unaligned),

            33 => self.one_bit_split_tile(aligned),
            34 => self.two_bit_split_tile(aligned),
            35 => self.three_bit_split_tile(aligned, unaligned),

            36 => self.cross_tile(aligned),
            37 => self.prime_tile(aligned, unaligned),

            38 => self.one_bank_tile(aligned, unaligned),
            39 => self.two_banks_tile(aligned, unaligned),

            40 => self.block_run(Traversal::Horizontal, aligned, unaligned),
            41 => self.block_run(Traversal::Vertical, aligned, unaligned),
            42 => self.block_run(Traversal::Diagonal1, aligned, unaligned),
            43 => self.block_run(Traversal::Diagonal2, aligned, unaligned),

            44 => self.block_run_banked(Traversal::Horizontal, aligned, unaligned),
            45 => self.block_run_banked(Traversal::Vertical, aligned, unaligned),
            46 => self.block_run_banked(Traversal::Diagonal1, aligned, unaligned),
            47 => self.block_run_banked(Traversal::Diagonal2, aligned, unaligned),

            48 => self.ro_motion8(unaligned),
            49 => {
                self.ro_motion8(unaligned);
                self.update4(aligned, unaligned);
            }
            50 => {
                self.ro_motion8(unaligned);
                self.update8(aligned, unaligned);
            }
            51 => {
                self.ro_motion8(unaligned);
                self.update16(aligned, unaligned);
            }

            52 => self.rc_motion8(unaligned),
            53 => {
                self.rc_motion8(unaligned);
                self.update4(aligned, unaligned);
            }
            54 => {
                self.rc_motion8(unaligned);
                self.update8(aligned, unaligned);
            }
            55 => {
                self.rc_motion8(unaligned);
                self.update16(aligned, unaligned);
            }

            56 => self.ro_motion4(aligned),
            57 => {
                self.ro_motion4(aligned);
                self.update4(aligned, unaligned);
            }
            58 => {
                self.ro_motion4(aligned);
                self.update8(aligned, unaligned);
            }
            59 => {
                self.ro_motion4(aligned);
                self.update16(aligned, unaligned);
            }

            60 => self.rc_motion4(aligned),
            61 => {
                self.rc_motion4(aligned);
                self.update4(aligned, unaligned);
            }
            62 => {
                self.rc_motion4(aligned);
                self.update8(aligned, unaligned);
            }
            63 => {
                self.rc_motion4(aligned);
                self.update16(aligned, unaligned);
            }

            _ => {} // opcodes are masked to 6 bits
        }
    }

    #[inline]
    fn set_pixel(&mut self, x: usize, y: usize, color: u8) {
        self.current[self.tile + x + y * self.width] = color;
    }

    /// Write relative to the tile origin; in bounds for every in-tile
    /// offset, guarded so the fixed-stride diagonal tables stay harmless on
    /// surfaces they were not authored for.
    #[inline]
    fn put(&mut self, offset: usize, color: u8) {
        if let Some(cell) = self.current.get_mut(self.tile + offset) {
            *cell = color;
        }
    }

    fn quadrant_offsets(&self) -> [usize; 4] {
        [0, 4, self.width * 4, self.width * 4 + 4]
    }

    /// Copies a `size`x`size` block out of the previous frame. `src` is a
    /// linear index into the previous buffer and may point outside it;
    /// out-of-range source pixels leave the destination untouched.
    fn copy_block(&mut self, dst_offset: usize, src: isize, size: usize) {
        let width = self.width;
        let len = self.previous.len();
        for y in 0..size {
            let dst = self.tile + dst_offset + y * width;
            let row_src = src + (y * width) as isize;
            if row_src >= 0 && row_src as usize + size <= len {
                let start = row_src as usize;
                let (cur, prev) = (&mut self.current, &self.previous);
                cur[dst..dst + size].copy_from_slice(&prev[start..start + size]);
            } else {
                for x in 0..size {
                    let p = row_src + x as isize;
                    if p >= 0 && (p as usize) < len {
                        self.current[dst + x] = self.previous[p as usize];
                    }
                }
            }
        }
    }

    fn raw_tile(&mut self, aligned: &mut StreamCursor<'_>) {
        for y in 0..8 {
            for x in 0..8 {
                let color = aligned.read_byte();
                self.set_pixel(x, y, color);
            }
        }
    }

    fn zero_motion(&mut self) {
        self.copy_block(0, self.tile as isize, 8);
    }

    fn short_motion8(&mut self, unaligned: &mut StreamCursor<'_>) {
        let (dx, dy) = nibble_motion(unaligned.read_byte());
        let center = self.tile as isize + (4 + self.width * 4) as isize;
        self.copy_block(0, center + dx + dy * self.width as isize, 8);
    }

    fn short_motion4(&mut self, aligned: &mut StreamCursor<'_>) {
        let width = self.width as isize;
        for quadrant in self.quadrant_offsets() {
            let (dx, dy) = nibble_motion(aligned.read_byte());
            let center = self.tile as isize + 2 + width * 2;
            self.copy_block(quadrant, center + dx + dy * width + quadrant as isize, 4);
        }
    }

    fn motion8(&mut self, unaligned: &mut StreamCursor<'_>) {
        let src = unaligned.read_u16() as isize;
        self.copy_block(0, src, 8);
    }

    fn motion4(&mut self, aligned: &mut StreamCursor<'_>) {
        for quadrant in self.quadrant_offsets() {
            let src = aligned.read_u16() as isize;
            self.copy_block(quadrant, src, 4);
        }
    }

    fn ro_motion8(&mut self, unaligned: &mut StreamCursor<'_>) {
        let rel = unaligned.read_i16() as isize;
        let center = self.tile as isize + (4 + self.width * 4) as isize;
        self.copy_block(0, center + rel, 8);
    }

    fn ro_motion4(&mut self, aligned: &mut StreamCursor<'_>) {
        let width = self.width as isize;
        for quadrant in self.quadrant_offsets() {
            let rel = aligned.read_i16() as isize;
            let center = self.tile as isize + 2 + width * 2;
            self.copy_block(quadrant, center + rel + quadrant as isize, 4);
        }
    }

    fn rc_motion8(&mut self, unaligned: &mut StreamCursor<'_>) {
        let rel = unaligned.read_xy_offset(self.width) as isize;
        let center = self.tile as isize + (4 + self.width * 4) as isize;
        self.copy_block(0, center + rel, 8);
    }

    fn rc_motion4(&mut self, aligned: &mut StreamCursor<'_>) {
        let width = self.width as isize;
        for quadrant in self.quadrant_offsets() {
            let rel = aligned.read_xy_offset(self.width) as isize;
            let center = self.tile as isize + 2 + width * 2;
            self.copy_block(quadrant, center + rel + quadrant as isize, 4);
        }
    }

    fn single_color_fill(&mut self, unaligned: &mut StreamCursor<'_>) {
        let color = unaligned.read_byte();
        for y in 0..8 {
            let start = self.tile + y * self.width;
            self.current[start..start + 8].fill(color);
        }
    }

    fn four_color_fill(&mut self, aligned: &mut StreamCursor<'_>) {
        let top_left = aligned.read_byte();
        let top_right = aligned.read_byte();
        let bottom_left = aligned.read_byte();
        let bottom_right = aligned.read_byte();
        for y in 0..4 {
            let upper = self.tile + y * self.width;
            let lower = self.tile + (y + 4) * self.width;
            self.current[upper..upper + 4].fill(top_left);
            self.current[upper + 4..upper + 8].fill(top_right);
            self.current[lower..lower + 4].fill(bottom_left);
            self.current[lower + 4..lower + 8].fill(bottom_right);
        }
    }

    // 8 mask bytes choose between two colors that trail the tile in the
    // unaligned stream.
    fn one_bit_tile(&mut self, aligned: &mut StreamCursor<'_>, unaligned: &mut StreamCursor<'_>) {
        let colors = [unaligned.peek(0), unaligned.peek(1)];
        for y in 0..8 {
            let mut mask = aligned.read_byte();
            for x in 0..8 {
                self.set_pixel(x, y, colors[(mask & 1) as usize]);
                mask >>= 1;
            }
        }
        unaligned.skip(2);
    }

    fn two_bit_tile(&mut self, aligned: &mut StreamCursor<'_>) {
        let colors = [
            aligned.read_byte(),
            aligned.read_byte(),
            aligned.read_byte(),
            aligned.read_byte(),
        ];
        for y in 0..8 {
            let mut bits = aligned.read_u16() as u32;
            for x in 0..8 {
                self.set_pixel(x, y, colors[(bits & 3) as usize]);
                bits >>= 2;
            }
        }
    }

    fn three_bit_tile(&mut self, aligned: &mut StreamCursor<'_>, unaligned: &mut StreamCursor<'_>) {
        for y in 0..8 {
            let mut bits = aligned.read_u32(3);
            for x in 0..8 {
                let color = unaligned.peek((bits & 7) as usize);
                self.set_pixel(x, y, color);
                bits >>= 3;
            }
        }
        unaligned.skip(8);
    }

    fn four_bit_tile(&mut self, aligned: &mut StreamCursor<'_>, unaligned: &mut StreamCursor<'_>) {
        for y in 0..8 {
            let mut bits = aligned.read_u32(4);
            for x in 0..8 {
                let color = unaligned.peek((bits & 15) as usize);
                self.set_pixel(x, y, color);
                bits >>= 4;
            }
        }
        unaligned.skip(16);
    }

    fn one_bit_split_tile(&mut self, aligned: &mut StreamCursor<'_>) {
        let width = self.width;
        for quadrant in self.quadrant_offsets() {
            let mut mask = aligned.read_u16();
            for y in 0..4 {
                for x in 0..4 {
                    let color = aligned.peek((mask & 1) as usize);
                    self.put(quadrant + x + y * width, color);
                    mask >>= 1;
                }
            }
            aligned.skip(2);
        }
    }

    fn two_bit_split_tile(&mut self, aligned: &mut StreamCursor<'_>) {
        let width = self.width;
        for quadrant in self.quadrant_offsets() {
            let mut bits = aligned.read_u32(4);
            let colors = [
                aligned.read_byte(),
                aligned.read_byte(),
                aligned.read_byte(),
                aligned.read_byte(),
            ];
            for y in 0..4 {
                for x in 0..4 {
                    self.put(quadrant + x + y * width, colors[(bits & 3) as usize]);
                    bits >>= 2;
                }
            }
        }
    }

    // One packed 24-bit read covers two rows of 3-bit indices.
    fn three_bit_split_tile(
        &mut self,
        aligned: &mut StreamCursor<'_>,
        unaligned: &mut StreamCursor<'_>,
    ) {
        let width = self.width;
        for quadrant in self.quadrant_offsets() {
            let mut bits = 0u32;
            for y in 0..4 {
                if y & 1 == 0 {
                    bits = aligned.read_u32(3);
                }
                for x in 0..4 {
                    let color = unaligned.peek((bits & 7) as usize);
                    self.put(quadrant + x + y * width, color);
                    bits >>= 3;
                }
            }
            unaligned.skip(8);
        }
    }

    // Four base colors per quadrant; one selector bit per ambiguous pixel,
    // the rest of the 4x4 follows a fixed pattern.
    fn cross_tile(&mut self, aligned: &mut StreamCursor<'_>) {
        let width = self.width;
        let mut value = aligned.read_u32(4);
        for quadrant in self.quadrant_offsets() {
            let c = [
                aligned.read_byte(),
                aligned.read_byte(),
                aligned.read_byte(),
                aligned.read_byte(),
            ];
            let v = value;
            let bit = |i: u32| ((v >> i) & 1) as usize;

            self.put(quadrant, c[bit(0)]);
            self.put(quadrant + 1, c[0]);
            self.put(quadrant + 2, c[0]);
            self.put(quadrant + 3, c[bit(1) * 3]);

            self.put(quadrant + width, c[1]);
            self.put(quadrant + width + 1, c[bit(2)]);
            self.put(quadrant + width + 2, c[bit(3) * 3]);
            self.put(quadrant + width + 3, c[3]);

            self.put(quadrant + width * 2, c[1]);
            self.put(quadrant + width * 2 + 1, c[1 + bit(4)]);
            self.put(quadrant + width * 2 + 2, c[2 + bit(5)]);
            self.put(quadrant + width * 2 + 3, c[3]);

            self.put(quadrant + width * 3, c[1 + bit(6)]);
            self.put(quadrant + width * 3 + 1, c[2]);
            self.put(quadrant + width * 3 + 2, c[2]);
            self.put(quadrant + width * 3 + 3, c[2 + bit(7)]);

            value >>= 8;
        }
    }

    fn prime_tile(&mut self, aligned: &mut StreamCursor<'_>, unaligned: &mut StreamCursor<'_>) {
        let background = unaligned.read_byte();
        for y in 0..8 {
            let mut mask = aligned.read_byte();
            for x in 0..8 {
                if mask & 1 != 0 {
                    let color = unaligned.read_byte();
                    self.set_pixel(x, y, color);
                } else {
                    self.set_pixel(x, y, background);
                }
                mask >>= 1;
            }
        }
    }

    // Like a raw tile, but with all colors in one palette bank so each
    // pixel packs into a nibble; low nibble first, the byte is consumed on
    // the odd pixel. The bank byte arrives prescaled in the stream.
    fn one_bank_tile(&mut self, aligned: &mut StreamCursor<'_>, unaligned: &mut StreamCursor<'_>) {
        let bank = unaligned.read_byte();
        for y in 0..8 {
            for x in 0..8 {
                let nibble = if x & 1 != 0 {
                    aligned.read_byte() >> 4
                } else {
                    aligned.peek(0) & 15
                };
                self.set_pixel(x, y, bank.wrapping_add(nibble));
            }
        }
    }

    // 5 bits per pixel: bit 4 picks one of two palette banks, bits 0-3 the
    // color within it. Rows are 40 bits pulled through a pair of 32-bit
    // windows advancing 5 bytes at a time.
    fn two_banks_tile(&mut self, aligned: &mut StreamCursor<'_>, unaligned: &mut StreamCursor<'_>) {
        let packed = unaligned.read_byte();
        let banks = [(packed & 0x0f) << 4, packed & 0xf0];
        for y in 0..8 {
            let mut low = aligned.peek_u32(0);
            let mut high = aligned.peek_u32(4);
            aligned.skip(5);
            for x in 0..8 {
                let bank = banks[((low & 16) >> 4) as usize];
                self.set_pixel(x, y, bank + (low & 15) as u8);
                low >>= 5;
                low |= high << 27;
                high >>= 5;
            }
        }
    }

    fn cell_offset(&self, order: Traversal, index: usize) -> usize {
        match order {
            Traversal::Horizontal => (index % 8) + (index / 8) * self.width,
            Traversal::Vertical => (index / 8) + (index % 8) * self.width,
            Traversal::Diagonal1 => DIAGONAL_OFFSETS_1[index],
            Traversal::Diagonal2 => DIAGONAL_OFFSETS_2[index],
        }
    }

    // Run-to-mask: one mask byte per eight cells; a set bit adopts a fresh
    // color from the unaligned stream, a clear bit repeats the last one.
    fn block_run(
        &mut self,
        order: Traversal,
        aligned: &mut StreamCursor<'_>,
        unaligned: &mut StreamCursor<'_>,
    ) {
        let mut last_color = 0u8;
        let mut mask = 0u8;
        for index in 0..64 {
            if index % 8 == 0 {
                mask = aligned.read_byte();
            }
            if mask & 1 != 0 {
                last_color = unaligned.read_byte();
            }
            mask >>= 1;
            let offset = self.cell_offset(order, index);
            self.put(offset, last_color);
        }
    }

    fn block_run_banked(
        &mut self,
        order: Traversal,
        aligned: &mut StreamCursor<'_>,
        unaligned: &mut StreamCursor<'_>,
    ) {
        let bank = unaligned.peek(0) << 4;
        let mut nibbles = BankNibbles::new();
        let mut last_color = 0u8;
        let mut mask = 0u8;
        for index in 0..64 {
            if index % 8 == 0 {
                mask = aligned.read_byte();
            }
            if mask & 1 != 0 {
                last_color = nibbles.next(unaligned);
            }
            mask >>= 1;
            let offset = self.cell_offset(order, index);
            self.put(offset, bank + last_color);
        }
        nibbles.finish(unaligned);
    }

    // A 24-bit packet carries four 3-bit x / 3-bit y patch positions; the
    // patch colors come from the aligned stream.
    fn update4(&mut self, aligned: &mut StreamCursor<'_>, unaligned: &mut StreamCursor<'_>) {
        let mut value = unaligned.read_u32(3);
        for _ in 0..4 {
            let color = aligned.read_byte();
            self.set_pixel((value & 7) as usize, ((value >> 3) & 7) as usize, color);
            value >>= 6;
        }
    }

    fn update8(&mut self, aligned: &mut StreamCursor<'_>, unaligned: &mut StreamCursor<'_>) {
        self.update4(aligned, unaligned);
        self.update4(aligned, unaligned);
    }

    fn update16(&mut self, aligned: &mut StreamCursor<'_>, unaligned: &mut StreamCursor<'_>) {
        for y in 0..8 {
            let mut mask = aligned.read_byte();
            for x in 0..8 {
                if mask & 1 != 0 {
                    let color = unaligned.read_byte();
                    self.set_pixel(x, y, color);
                }
                mask >>= 1;
            }
        }
    }
}
