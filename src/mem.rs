//! Sparse byte addressable backing store.

use crate::Error;
use std::collections::BTreeMap;
use std::io::{BufRead, Write};

/// Textual encoding of a program image.
#[derive(
    Debug, Default, strum::Display, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum,
)]
#[strum(serialize_all = "lowercase")]
pub enum ImageFormat {
    /// Eight hex digits per line.
    #[default]
    Hex,
    /// Thirty-two `0`/`1` characters per line.
    Bin,
}

impl ImageFormat {
    #[must_use]
    fn digits(self) -> usize {
        match self {
            Self::Hex => 8,
            Self::Bin => 32,
        }
    }

    #[must_use]
    fn radix(self) -> u32 {
        match self {
            Self::Hex => 16,
            Self::Bin => 2,
        }
    }
}

/// Little-endian memory where every byte that was never written reads as zero.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Memory {
    bytes: BTreeMap<u32, u8>,
}

impl Memory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn read(&self, addr: u32, len: usize) -> Vec<u8> {
        (0..len)
            .map(|offset| {
                let addr = addr.wrapping_add(offset as u32);
                self.bytes.get(&addr).copied().unwrap_or(0)
            })
            .collect()
    }

    pub fn write(&mut self, addr: u32, data: &[u8]) {
        for (offset, byte) in data.iter().enumerate() {
            let addr = addr.wrapping_add(offset as u32);
            if *byte == 0 {
                self.bytes.remove(&addr);
            } else {
                self.bytes.insert(addr, *byte);
            }
        }
    }

    #[must_use]
    pub fn read_u32(&self, addr: u32) -> u32 {
        let bytes = self.read(addr, 4);
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    pub fn write_u32(&mut self, addr: u32, value: u32) {
        self.write(addr, &value.to_le_bytes());
    }

    /// Loads one instruction word per line, starting at `base`.
    ///
    /// Returns the number of words loaded.
    pub fn load_image(
        &mut self,
        reader: impl BufRead,
        format: ImageFormat,
        base: u32,
    ) -> Result<usize, Error> {
        let mut addr = base;
        let mut words = 0;
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            let Some(word) = parse_line(&line, format).map_err(|reason| {
                Error::MalformedProgram {
                    line: idx + 1,
                    reason,
                }
            })?
            else {
                continue;
            };
            self.write_u32(addr, word);
            addr = addr.wrapping_add(4);
            words += 1;
        }
        log::debug!(
            "loaded {} {} words at {:#010x}",
            words,
            format,
            base
        );
        Ok(words)
    }

    /// Non-zero words in ascending address order.
    pub fn words(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let mut bases: Vec<u32> = self.bytes.keys().map(|addr| addr & !3).collect();
        bases.dedup();
        bases
            .into_iter()
            .map(move |base| (base, self.read_u32(base)))
            .filter(|(_, word)| *word != 0)
    }

    /// Writes `0x<addr> 0x<word>` for every non-zero word.
    pub fn dump(&self, mut writer: impl Write) -> Result<(), Error> {
        for (addr, word) in self.words() {
            writeln!(writer, "{addr:#010x} {word:#010x}")?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Parses one image line, `None` for blank and comment lines.
fn parse_line(line: &str, format: ImageFormat) -> Result<Option<u32>, String> {
    let line = match line.find("//") {
        Some(idx) => &line[..idx],
        None => line,
    };
    let line = match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    };
    let digits: String = line
        .trim()
        .chars()
        .filter(|c| *c != '_')
        .collect();
    if digits.is_empty() {
        return Ok(None);
    }
    if digits.len() != format.digits() {
        return Err(format!(
            "expected {} {} digits, found {}",
            format.digits(),
            format,
            digits.len()
        ));
    }
    if let Some(bad) = digits.chars().find(|c| !c.is_digit(format.radix())) {
        return Err(format!("invalid {format} digit {bad:?} in {digits:?}"));
    }
    u32::from_str_radix(&digits, format.radix())
        .map(Some)
        .map_err(|err| format!("invalid {format} word {digits:?}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::{ImageFormat, Memory};
    use color_eyre::eyre;

    #[test]
    fn uninitialized_reads_zero() {
        let mem = Memory::new();
        assert_eq!(mem.read(0xdead_beef, 3), vec![0, 0, 0]);
        assert_eq!(mem.read_u32(0x100), 0);
    }

    #[test]
    fn little_endian_words() {
        let mut mem = Memory::new();
        mem.write_u32(0x10, 0x1122_3344);
        utils::diff::assert_eq!(have: mem.read(0x10, 4), want: vec![0x44, 0x33, 0x22, 0x11]);
        mem.write(0x12, &[0xAA]);
        assert_eq!(mem.read_u32(0x10), 0x11AA_3344);
    }

    #[test]
    fn loads_hex_image() -> eyre::Result<()> {
        let image = "\
            // header comment\n\
            0000_0000\n\
            \n\
            deadbeef # trailing\n\
            0000007f\n";
        let mut mem = Memory::new();
        let words = mem.load_image(image.as_bytes(), ImageFormat::Hex, 0x40)?;
        assert_eq!(words, 3);
        assert_eq!(mem.read_u32(0x44), 0xdead_beef);
        assert_eq!(mem.read_u32(0x48), 0x7f);
        Ok(())
    }

    #[test]
    fn loads_binary_image() -> eyre::Result<()> {
        let image = "0000_0000_0000_0000_0000_0000_0111_1111\n";
        let mut mem = Memory::new();
        mem.load_image(image.as_bytes(), ImageFormat::Bin, 0)?;
        assert_eq!(mem.read_u32(0), 0x7f);
        Ok(())
    }

    #[test]
    fn malformed_line_reports_line_number() {
        let image = "00000000\n\n0000000g\n";
        let err = Memory::new()
            .load_image(image.as_bytes(), ImageFormat::Hex, 0)
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::MalformedProgram { line: 3, .. }
        ));

        let err = Memory::new()
            .load_image("0101".as_bytes(), ImageFormat::Bin, 0)
            .unwrap_err();
        assert!(err.to_string().starts_with("line 1:"), "{err}");
    }

    #[test]
    fn sign_prefixed_lines_are_rejected() {
        for (image, format) in [
            ("+1234567\n", ImageFormat::Hex),
            ("+0000000000000000000000001111111\n", ImageFormat::Bin),
            ("-1234567\n", ImageFormat::Hex),
        ] {
            let err = Memory::new()
                .load_image(image.as_bytes(), format, 0)
                .unwrap_err();
            assert!(
                matches!(err, crate::Error::MalformedProgram { line: 1, .. }),
                "{format}: {err}"
            );
        }
    }

    #[test]
    fn dump_skips_zero_words() -> eyre::Result<()> {
        let mut mem = Memory::new();
        mem.write_u32(0x20, 7);
        mem.write_u32(0x4, 0xffff_0000);
        mem.write_u32(0x8, 0);
        mem.write_u32(0x30, 5);
        mem.write_u32(0x30, 0);
        let mut out = Vec::new();
        mem.dump(&mut out)?;
        utils::diff::assert_eq!(
            have: String::from_utf8(out)?,
            want: "0x00000004 0xffff0000\n0x00000020 0x00000007\n".to_string()
        );
        Ok(())
    }
}
