//! # Display Collaborators
//!
//! Screens receive a finished [`Layout`] and put it somewhere visible.
//!
//! - [`TerminalScreen`]: the whole layout as framed text, for development
//!   without hardware
//! - [`FrameBufferScreen`]: each three-row page of the layout drawn with
//!   `embedded-graphics` into a 1-bit-per-pixel buffer in SSD1306 page order,
//!   ready for a panel driver to cycle through
//!
//! Panel wiring (I2C/SPI, init sequences) is not handled here.

use crate::renderer::Layout;
use embedded_graphics::{
    mono_font::{ascii::FONT_6X10, MonoTextStyle},
    pixelcolor::BinaryColor,
    prelude::*,
    text::{Baseline, Text},
};
use std::convert::Infallible;
use std::io::{self, Write};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DisplayError {
    #[error("display output: {0}")]
    Io(#[from] io::Error),
}

/// Something a layout can be shown on.
pub trait Screen {
    fn show(&mut self, layout: &Layout) -> Result<(), DisplayError>;
}

impl<S: Screen + ?Sized> Screen for Box<S> {
    fn show(&mut self, layout: &Layout) -> Result<(), DisplayError> {
        (**self).show(layout)
    }
}

/// Prints each layout as a framed block of text.
pub struct TerminalScreen<W: Write> {
    out: W,
}

impl TerminalScreen<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> TerminalScreen<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Text lines for the terminal view of a layout.
pub fn terminal_lines(layout: &Layout) -> Vec<String> {
    let mut lines = vec![format!("[screen {}] {}", layout.screen + 1, layout.title)];

    for departure in &layout.departures {
        let mut line = departure.text(layout.columns);
        if let Some(minutes) = departure.minutes_away.filter(|m| *m > 0) {
            line.push_str(&format!("  (in {minutes} min)"));
        }
        lines.push(line);
        // Continuation of a wrapped destination
        for extra in departure.destination.iter().skip(1) {
            lines.push(format!("  {extra}"));
        }
    }
    lines.extend(layout.due.iter().cloned());
    lines.extend(layout.notice.iter().cloned());
    lines.extend(layout.calling_at.iter().cloned());
    lines.extend(layout.alert.iter().map(|l| format!("! {l}")));
    lines.push(layout.status_line());
    lines
}

impl<W: Write> Screen for TerminalScreen<W> {
    fn show(&mut self, layout: &Layout) -> Result<(), DisplayError> {
        let lines = terminal_lines(layout);
        let width = lines.iter().map(|l| l.chars().count()).max().unwrap_or(0);
        let rule = format!("+{}+", "-".repeat(width + 2));

        writeln!(self.out, "{rule}")?;
        for line in &lines {
            writeln!(self.out, "| {line:<width$} |")?;
        }
        writeln!(self.out, "{rule}")?;
        self.out.flush()?;
        Ok(())
    }
}

/// Monochrome framebuffer laid out like SSD1306 display RAM.
///
/// Each byte covers eight vertical pixels of one column; a page is one
/// full-width band of eight rows. Bit 0 is the top pixel of the band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBuffer {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl FrameBuffer {
    pub fn new(width: u32, height: u32) -> Self {
        let pages = height.div_ceil(8);
        Self {
            width,
            height,
            pixels: vec![0x00; (width * pages) as usize],
        }
    }

    pub fn clear(&mut self) {
        self.pixels.fill(0x00);
    }

    /// Raw page-ordered bytes for the panel.
    pub fn as_bytes(&self) -> &[u8] {
        &self.pixels
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, on: bool) {
        if x >= self.width || y >= self.height {
            return;
        }
        let index = ((y / 8) * self.width + x) as usize;
        let mask = 1u8 << (y % 8);
        if on {
            self.pixels[index] |= mask;
        } else {
            self.pixels[index] &= !mask;
        }
    }

    pub fn is_on(&self, x: u32, y: u32) -> bool {
        if x >= self.width || y >= self.height {
            return false;
        }
        let index = ((y / 8) * self.width + x) as usize;
        self.pixels[index] & (1u8 << (y % 8)) != 0
    }

    /// Lit pixels within rows `top..bottom`.
    pub fn lit_in_rows(&self, top: u32, bottom: u32) -> usize {
        (top..bottom.min(self.height))
            .flat_map(|y| (0..self.width).map(move |x| (x, y)))
            .filter(|&(x, y)| self.is_on(x, y))
            .count()
    }

    /// `#`/`.` dump, one text line per pixel row.
    pub fn to_ascii(&self) -> String {
        let mut out = String::with_capacity(((self.width + 1) * self.height) as usize);
        for y in 0..self.height {
            for x in 0..self.width {
                out.push(if self.is_on(x, y) { '#' } else { '.' });
            }
            out.push('\n');
        }
        out
    }
}

impl OriginDimensions for FrameBuffer {
    fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }
}

impl DrawTarget for FrameBuffer {
    type Color = BinaryColor;
    type Error = Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        for Pixel(point, color) in pixels {
            if let (Ok(x), Ok(y)) = (u32::try_from(point.x), u32::try_from(point.y)) {
                self.set_pixel(x, y, color.is_on());
            }
        }
        Ok(())
    }
}

/// Row tops for a 32 px panel with a 10 px font.
const ROW_TOPS: [i32; 3] = [0, 11, 22];

/// Draws every page of a layout into its own [`FrameBuffer`].
pub struct FrameBufferScreen {
    width: u32,
    height: u32,
    frames: Vec<FrameBuffer>,
    preview: bool,
}

impl FrameBufferScreen {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            frames: vec![FrameBuffer::new(width, height)],
            preview: false,
        }
    }

    /// Also print each frame to stdout as ASCII art.
    pub fn with_preview(mut self, preview: bool) -> Self {
        self.preview = preview;
        self
    }

    /// The first page.
    pub fn buffer(&self) -> &FrameBuffer {
        &self.frames[0]
    }

    /// Pages of the last layout shown, in display order.
    pub fn frames(&self) -> &[FrameBuffer] {
        &self.frames
    }

    fn draw(&mut self, layout: &Layout) {
        let style = MonoTextStyle::new(&FONT_6X10, BinaryColor::On);
        let pages = layout.frames();
        self.frames.resize_with(pages.len(), || FrameBuffer::new(self.width, self.height));

        for (buffer, rows) in self.frames.iter_mut().zip(&pages) {
            buffer.clear();
            for (row, top) in rows.iter().zip(ROW_TOPS) {
                Text::with_baseline(row, Point::new(0, top), style, Baseline::Top)
                    .draw(buffer)
                    .ok();
            }
        }
    }
}

impl Screen for FrameBufferScreen {
    fn show(&mut self, layout: &Layout) -> Result<(), DisplayError> {
        self.draw(layout);
        if self.preview {
            let mut out = io::stdout().lock();
            for (page, buffer) in self.frames.iter().enumerate() {
                writeln!(out, "screen {} page {}:", layout.screen + 1, page + 1)?;
                out.write_all(buffer.to_ascii().as_bytes())?;
            }
            out.flush()?;
        }
        Ok(())
    }
}
