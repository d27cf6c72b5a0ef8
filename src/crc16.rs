//! CRC-16 variants used across the supported formats.
//!
//! Generalized from the teacher crate's single `calc_crc` helper (CRC-16/XMODEM
//! over a MacBinary header) into the two algorithms this crate actually needs:
//! XMODEM (BinHex header/fork CRCs and MacBinary's header CRC share the same
//! poly 0x1021, init 0, unreflected algorithm) and the StuffIt reflected
//! CRC-16 (poly 0x8005, reflected in/out, init 0), which is a distinct
//! algorithm grounded on `sit_crc_table`/`sit_crc` in `sit.c`.

use crc::{Algorithm, Crc, CRC_16_XMODEM};

/// CRC-16/XMODEM: used by BinHex (header and per-fork CRCs) and MacBinary
/// (header CRC at bytes 124..125).
pub fn xmodem(data: &[u8]) -> u16 {
    let crc: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);
    crc.checksum(data)
}

/// Running XMODEM CRC accumulator, so callers can feed CRC bytes themselves
/// and check the running value settles to zero (the way BinHex and CPT's
/// directory-adjacent checks both do it).
pub struct XmodemCrc(u16);

impl XmodemCrc {
    pub fn new() -> Self {
        XmodemCrc(0)
    }

    pub fn update(&mut self, byte: u8) {
        self.0 = xmodem_step(self.0, byte);
    }

    pub fn value(&self) -> u16 {
        self.0
    }
}

impl Default for XmodemCrc {
    fn default() -> Self {
        Self::new()
    }
}

fn xmodem_step(crc: u16, byte: u8) -> u16 {
    let mut crc = crc ^ ((byte as u16) << 8);
    for _ in 0..8 {
        crc = if crc & 0x8000 != 0 {
            (crc << 1) ^ 0x1021
        } else {
            crc << 1
        };
    }
    crc
}

/// The StuffIt reflected CRC-16: poly 0x8005, reflected in/out, init 0, xorout 0.
/// Used by both SIT classic (per-fork CRC) and SIT5 (header CRC with bytes
/// 32..33 zeroed, and per-fork data CRC).
const SIT_CRC16: Algorithm<u16> = Algorithm {
    width: 16,
    poly: 0x8005,
    init: 0x0000,
    refin: true,
    refout: true,
    xorout: 0x0000,
    check: 0xbb3d,
    residue: 0x0000,
};

pub fn sit_crc(data: &[u8]) -> u16 {
    let crc: Crc<u16> = Crc::<u16>::new(&SIT_CRC16);
    crc.checksum(data)
}

/// Running reflected-CRC-16 accumulator for streaming SIT fork decode.
pub struct SitCrc {
    crc: Crc<u16>,
    value: u16,
}

impl SitCrc {
    pub fn new() -> Self {
        let crc: Crc<u16> = Crc::<u16>::new(&SIT_CRC16);
        SitCrc { crc, value: 0 }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        // There is no incremental API that mixes cleanly with a running
        // value here without a `Digest`, so fold bytes through the
        // bit-level reflected update directly (same table-free approach
        // `sit_crc_update` in the C reference uses).
        for &b in bytes {
            self.value = sit_crc_step(self.value, b);
        }
        let _ = &self.crc; // retained to document which algorithm this mirrors
    }

    pub fn finalize(self) -> u16 {
        self.value
    }
}

fn sit_crc_step(crc: u16, byte: u8) -> u16 {
    let mut crc = crc ^ (byte as u16);
    for _ in 0..8 {
        crc = if crc & 1 != 0 {
            (crc >> 1) ^ 0xa001
        } else {
            crc >> 1
        };
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xmodem_matches_crc_crate() {
        let crc: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);
        let expected = crc.checksum(b"123456789");
        assert_eq!(xmodem(b"123456789"), expected);
    }

    #[test]
    fn xmodem_running_matches_oneshot() {
        let mut running = XmodemCrc::new();
        for b in b"hello, world" {
            running.update(*b);
        }
        assert_eq!(running.value(), xmodem(b"hello, world"));
    }

    #[test]
    fn sit_crc_check_value() {
        // The `check` value in SIT_CRC16 (0xbb3d) is defined over "123456789";
        // verifying it here pins the algorithm parameters against a
        // well-known CRC-16/ARC-family test vector.
        assert_eq!(sit_crc(b"123456789"), 0xbb3d);
    }
}
