// Adler-32 (RFC 1950) over the scanned lines of a message

const MOD_ADLER: u32 = 65_521;
// Largest n such that 255n(n+1)/2 + (n+1)(MOD_ADLER-1) fits in u32
const NMAX: usize = 5552;

#[derive(Debug, Clone, Copy)]
pub struct Adler32 {
    a: u32,
    b: u32,
}

impl Adler32 {
    pub fn new() -> Self {
        Self { a: 1, b: 0 }
    }

    pub fn update(&mut self, data: &[u8]) {
        for chunk in data.chunks(NMAX) {
            for &byte in chunk {
                self.a += u32::from(byte);
                self.b += self.a;
            }
            self.a %= MOD_ADLER;
            self.b %= MOD_ADLER;
        }
    }

    pub fn finish(&self) -> u32 {
        (self.b << 16) | self.a
    }
}

impl Default for Adler32 {
    fn default() -> Self {
        Self::new()
    }
}

/// Checksum of a message given as its lines (start line, header lines, body lines).
pub fn checksum_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> u32 {
    let mut adler = Adler32::new();
    for line in lines {
        adler.update(line.as_bytes());
    }
    adler.finish()
}
