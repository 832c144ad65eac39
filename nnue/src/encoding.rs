use cozy_chess::{Board, Color, Piece, Square};

use crate::error::{Error, Result};

// Feature Layout (768 total), seen from one perspective:
//
//   [Own pieces: P N B R Q K][Enemy pieces: P N B R Q K]
//   └─ 6 x 64 squares ──────┘└─ 6 x 64 squares ────────┘
//
// index = (color * 6 + piece) * 64 + square
//
// For the black perspective the board is mirrored vertically and the
// colors swapped, so both perspectives share the same weights.
//
// Record layout (129 bytes):
//
//   [stm: 32 x u16 LE][sntm: 32 x u16 LE][target: u8]
//   └─── 64 bytes ───┘└──── 64 bytes ───┘└─ 1 byte ─┘
//
// Feature lists shorter than 32 are padded with SENTINEL.

pub const NUM_FEATURES: usize = Square::NUM * Piece::NUM * Color::NUM;

/// Maximum number of active features per perspective.
pub const MAX_FEATURES: usize = 32;

/// Marks the end of a feature list.
pub const SENTINEL: u16 = u16::MAX;

/// Size in bytes of one encoded feature set.
pub const FEATURE_SET_SIZE: usize = MAX_FEATURES * std::mem::size_of::<u16>();

/// Size in bytes of one dataset record.
pub const RECORD_SIZE: usize = FEATURE_SET_SIZE * 2 + 1;

/// Feature index of a piece seen from `perspective`.
pub fn feature(perspective: Color, color: Color, piece: Piece, square: Square) -> usize {
    let (color, square) = match perspective {
        Color::White => (color, square),
        Color::Black => (!color, square.flip_rank()),
    };
    (color as usize * Piece::NUM + piece as usize) * Square::NUM + square as usize
}

/// Active features of a board from the side to move's and the other side's view.
pub fn board_features(board: &Board) -> (Vec<u16>, Vec<u16>) {
    let stm = board.side_to_move();
    let perspective_features = |perspective: Color| {
        let mut features = Vec::with_capacity(MAX_FEATURES);
        for color in Color::ALL {
            for piece in Piece::ALL {
                for square in board.colored_pieces(color, piece) {
                    features.push(feature(perspective, color, piece, square) as u16);
                }
            }
        }
        features
    };
    (perspective_features(stm), perspective_features(!stm))
}

/// Iterates the active indices of the feature set stored at `offset`.
/// Stops at the first sentinel; the remaining slots are padding.
pub fn active_features(buffer: &[u8], offset: usize) -> impl Iterator<Item = u16> + '_ {
    buffer[offset..offset + FEATURE_SET_SIZE]
        .chunks_exact(2)
        .map(|bytes| u16::from_le_bytes([bytes[0], bytes[1]]))
        .take_while(|&index| index != SENTINEL)
}

/// Decodes the feature set at `offset` into `dense`, which must hold
/// `NUM_FEATURES` zeroed values.
pub fn decode_features_into(buffer: &[u8], offset: usize, dense: &mut [f32]) {
    debug_assert_eq!(dense.len(), NUM_FEATURES);
    for index in active_features(buffer, offset) {
        dense[index as usize] = 1.0;
    }
}

/// Decodes the feature set at `offset` into a dense 0/1 vector.
pub fn decode_features(buffer: &[u8], offset: usize) -> Vec<f32> {
    let mut dense = vec![0.0; NUM_FEATURES];
    decode_features_into(buffer, offset, &mut dense);
    dense
}

/// Encodes a list of active features (any order) into a fixed-width set.
pub fn encode_features(indices: &[u16]) -> Result<[u8; FEATURE_SET_SIZE]> {
    if indices.len() > MAX_FEATURES {
        return Err(Error::Format(format!(
            "{} active features, at most {} fit in a record",
            indices.len(),
            MAX_FEATURES
        )));
    }

    if let Some(bad) = indices.iter().find(|&&i| i as usize >= NUM_FEATURES) {
        return Err(Error::Format(format!(
            "feature index {} is outside [0, {})",
            bad, NUM_FEATURES
        )));
    }

    let mut encoded = [0u8; FEATURE_SET_SIZE];
    let padded = indices
        .iter()
        .copied()
        .chain(std::iter::repeat(SENTINEL))
        .take(MAX_FEATURES);

    for (slot, index) in encoded.chunks_exact_mut(2).zip(padded) {
        slot.copy_from_slice(&index.to_le_bytes());
    }

    Ok(encoded)
}

/// Checks that every feature set of the record at `offset` only names valid features.
pub fn validate_record(buffer: &[u8], offset: usize) -> Result<()> {
    for set_offset in [offset, offset + FEATURE_SET_SIZE] {
        if let Some(bad) = active_features(buffer, set_offset).find(|&i| i as usize >= NUM_FEATURES)
        {
            return Err(Error::Format(format!(
                "record at byte {} has feature index {} outside [0, {})",
                offset, bad, NUM_FEATURES
            )));
        }
    }
    Ok(())
}

pub fn target_to_win_rate(target: u8) -> f32 {
    target as f32 / u8::MAX as f32
}

pub fn win_rate_to_target(win_rate: f32) -> u8 {
    (win_rate.clamp(0.0, 1.0) * u8::MAX as f32).round() as u8
}

/// One training record before it is written to disk.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub stm_features: Vec<u16>,
    pub sntm_features: Vec<u16>,
    pub target: u8,
}

impl Record {
    pub fn from_board(board: &Board, win_rate: f32) -> Self {
        let (stm_features, sntm_features) = board_features(board);
        Self {
            stm_features,
            sntm_features,
            target: win_rate_to_target(win_rate),
        }
    }

    pub fn encode(&self) -> Result<[u8; RECORD_SIZE]> {
        let mut bytes = [0u8; RECORD_SIZE];
        bytes[..FEATURE_SET_SIZE].copy_from_slice(&encode_features(&self.stm_features)?);
        bytes[FEATURE_SET_SIZE..FEATURE_SET_SIZE * 2]
            .copy_from_slice(&encode_features(&self.sntm_features)?);
        bytes[RECORD_SIZE - 1] = self.target;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn active_set(dense: &[f32]) -> BTreeSet<u16> {
        dense
            .iter()
            .enumerate()
            .filter(|(_, &v)| v == 1.0)
            .map(|(i, _)| i as u16)
            .collect()
    }

    #[test]
    fn test_record_size() {
        assert_eq!(NUM_FEATURES, 768);
        assert_eq!(RECORD_SIZE, 129);
    }

    #[test]
    fn test_encode_decode_recovers_active_set() {
        let cases: [&[u16]; 4] = [
            &[],
            &[767, 0, 5, 400],
            &[3, 2, 1],
            &[
                0, 24, 48, 72, 96, 120, 144, 168, 192, 216, 240, 264, 288, 312, 336, 360, 384,
                408, 432, 456, 480, 504, 528, 552, 576, 600, 624, 648, 672, 696, 720, 767,
            ],
        ];

        for indices in cases {
            let encoded = encode_features(indices).unwrap();
            let dense = decode_features(&encoded, 0);
            let expected: BTreeSet<u16> = indices.iter().copied().collect();
            assert_eq!(active_set(&dense), expected);
        }
    }

    #[test]
    fn test_encode_pads_with_sentinel() {
        let encoded = encode_features(&[7]).unwrap();
        assert_eq!(&encoded[..2], &7u16.to_le_bytes());
        assert!(encoded[2..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_encode_rejects_too_many_features() {
        let indices: Vec<u16> = (0..33).collect();
        assert!(matches!(encode_features(&indices), Err(Error::Format(_))));
    }

    #[test]
    fn test_encode_rejects_out_of_range_feature() {
        assert!(matches!(encode_features(&[768]), Err(Error::Format(_))));
    }

    #[test]
    fn test_decode_stops_at_sentinel() {
        let mut bytes = encode_features(&[1, 2]).unwrap();
        // A value after the sentinel is padding and must be ignored.
        bytes[8..10].copy_from_slice(&9u16.to_le_bytes());
        let dense = decode_features(&bytes, 0);
        assert_eq!(active_set(&dense), BTreeSet::from([1, 2]));
    }

    #[test]
    fn test_target_conversion() {
        assert_eq!(target_to_win_rate(255), 1.0);
        assert_eq!(target_to_win_rate(0), 0.0);
        assert!((target_to_win_rate(128) - 0.50196).abs() < 1e-5);
        assert_eq!(win_rate_to_target(1.0), 255);
        assert_eq!(win_rate_to_target(0.5), 128);
        assert_eq!(win_rate_to_target(-3.0), 0);
    }

    #[test]
    fn test_feature_perspective_mirrors() {
        let white = feature(Color::White, Color::White, Piece::King, Square::E1);
        let black = feature(Color::Black, Color::Black, Piece::King, Square::E8);
        assert_eq!(white, black);
        assert_eq!(white, Piece::King as usize * 64 + Square::E1 as usize);

        let enemy = feature(Color::White, Color::Black, Piece::Pawn, Square::A7);
        assert_eq!(enemy, 6 * 64 + Square::A7 as usize);
    }

    #[test]
    fn test_start_position_record() {
        let board = Board::default();
        let record = Record::from_board(&board, 0.5);
        assert_eq!(record.stm_features.len(), 32);
        assert_eq!(record.sntm_features.len(), 32);

        // The start position is symmetric, so both perspectives see the same features.
        let stm: BTreeSet<_> = record.stm_features.iter().collect();
        let sntm: BTreeSet<_> = record.sntm_features.iter().collect();
        assert_eq!(stm, sntm);

        let bytes = record.encode().unwrap();
        assert_eq!(bytes[RECORD_SIZE - 1], 128);
        validate_record(&bytes, 0).unwrap();
    }
}
