//! Equivalence tests for the three mask representations: for every mask,
//! converting between bit, byte and selection forms must round-trip exactly,
//! including through the eight-lane and sixty-four-lane fast paths.

use kestrel::util::mask::{
    bit_vector_to_byte_vector, bit_vector_to_selection_vector, byte_vector_to_bit_vector,
    byte_vector_to_selection_vector, diff_selected, selection_vector_to_byte_vector, SelVal,
};

fn make_byte_vector(n: usize, pred: impl Fn(usize) -> bool) -> Vec<u8> {
    (0..n).map(|i| if pred(i) { 0xFF } else { 0x00 }).collect()
}

fn masks_under_test(n: usize) -> Vec<Vec<u8>> {
    vec![
        make_byte_vector(n, |_| false),
        make_byte_vector(n, |_| true),
        make_byte_vector(n, |i| i % 2 == 0),
        make_byte_vector(n, |i| i % 7 == 3),
        make_byte_vector(n, |i| (i / 64) % 2 == 0),
        make_byte_vector(n, |i| (i * 2_654_435_761) % 5 < 2),
        make_byte_vector(n, |i| i == 0 || i == n - 1),
    ]
}

#[test]
fn bit_byte_selection_round_trips() {
    for n in [1usize, 7, 8, 9, 63, 64, 65, 127, 128, 500, 2047, 2048] {
        for bytes in masks_under_test(n) {
            // byte -> bit -> byte
            let mut words = vec![0u64; n.div_ceil(64)];
            byte_vector_to_bit_vector(n, &bytes, &mut words);
            let mut bytes_back = vec![0u8; n];
            bit_vector_to_byte_vector(n, &words, &mut bytes_back);
            assert_eq!(bytes, bytes_back, "byte<->bit mismatch at n={n}");

            // byte -> selection -> byte
            let mut sel = vec![0 as SelVal; n + 8];
            let count = byte_vector_to_selection_vector(n, &bytes, &mut sel);
            let mut from_sel = vec![0u8; n];
            selection_vector_to_byte_vector(count, &sel, &mut from_sel);
            assert_eq!(bytes, from_sel, "byte<->selection mismatch at n={n}");

            // bit -> selection must agree with byte -> selection
            let mut sel_from_bits = vec![0 as SelVal; n];
            let count_from_bits = bit_vector_to_selection_vector(n, &words, &mut sel_from_bits);
            assert_eq!(count, count_from_bits);
            assert_eq!(&sel[..count], &sel_from_bits[..count]);

            // Contract: for all i, bit[i] == (byte[i] != 0) == (i in sel).
            for i in 0..n {
                let in_bit = (words[i / 64] >> (i % 64)) & 1 != 0;
                let in_byte = bytes[i] != 0;
                let in_sel = sel[..count].binary_search(&(i as SelVal)).is_ok();
                assert_eq!(in_bit, in_byte);
                assert_eq!(in_byte, in_sel);
            }
        }
    }
}

#[test]
fn selection_vectors_are_strictly_ascending() {
    let n = 2048;
    let bytes = make_byte_vector(n, |i| i % 3 != 1);
    let mut sel = vec![0 as SelVal; n + 8];
    let count = byte_vector_to_selection_vector(n, &bytes, &mut sel);
    assert!(sel[..count].windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn diff_selected_is_the_exact_complement() {
    let n = 777;
    let bytes = make_byte_vector(n, |i| i % 5 == 0 || i % 11 == 0);
    let mut sel = vec![0 as SelVal; n];
    let m = byte_vector_to_selection_vector(n, &bytes, &mut sel);

    let mut complement = vec![0 as SelVal; n];
    let k = diff_selected(n, &sel, m, &mut complement);
    assert_eq!(m + k, n);

    let mut all: Vec<SelVal> = sel[..m].to_vec();
    all.extend_from_slice(&complement[..k]);
    all.sort_unstable();
    let expected: Vec<SelVal> = (0..n as u16).collect();
    assert_eq!(all, expected);
}
