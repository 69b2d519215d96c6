//! XXTEA and XTEA block decryption.
//!
//! Both ciphers operate on 32-bit words in place. Every addition, subtraction and shift wraps
//! exactly like the unsigned 32-bit arithmetic of the reference implementations; a single
//! checked operation would make the output diverge.

/// Key schedule constant shared by TEA, XTEA and XXTEA.
pub const DELTA: u32 = 0x9E37_79B9;

#[inline]
fn xxtea_mx(z: u32, y: u32, sum: u32, key: &[u32; 4], p: usize, e: usize) -> u32 {
    (((z >> 5) ^ (y << 2)).wrapping_add((y >> 3) ^ (z << 4)))
        ^ ((sum ^ y).wrapping_add(key[(p & 3) ^ e] ^ z))
}

/// Decrypt `v` in place with XXTEA (corrected block TEA).
///
/// The round count is `6 + 52 / n` for `n` words. A one-word block runs 58 rounds that mix
/// the word with itself; an empty block is left as is.
pub fn xxtea_decrypt(v: &mut [u32], key: &[u32; 4]) {
    let n = v.len();
    if n == 0 {
        return;
    }

    let rounds = 6 + 52 / n as u32;
    let mut sum = rounds.wrapping_mul(DELTA);
    let mut y = v[0];

    for _ in 0..rounds {
        let e = ((sum >> 2) & 3) as usize;
        for p in (1..n).rev() {
            let z = v[p - 1];
            v[p] = v[p].wrapping_sub(xxtea_mx(z, y, sum, key, p, e));
            y = v[p];
        }
        let z = v[n - 1];
        v[0] = v[0].wrapping_sub(xxtea_mx(z, y, sum, key, 0, e));
        y = v[0];
        sum = sum.wrapping_sub(DELTA);
    }
}

/// Decrypt one 64-bit block with XTEA using `rounds` rounds.
pub fn xtea_decrypt(v0: &mut u32, v1: &mut u32, key: &[u32; 4], rounds: u32) {
    let mut sum = DELTA.wrapping_mul(rounds);
    for _ in 0..rounds {
        *v1 = v1.wrapping_sub(
            ((*v0 << 4) ^ (*v0 >> 5)).wrapping_add(*v0)
                ^ sum.wrapping_add(key[((sum >> 11) & 3) as usize]),
        );
        sum = sum.wrapping_sub(DELTA);
        *v0 = v0.wrapping_sub(
            ((*v1 << 4) ^ (*v1 >> 5)).wrapping_add(*v1)
                ^ sum.wrapping_add(key[(sum & 3) as usize]),
        );
    }
}

/// Reinterpret little-endian bytes as 32-bit words. Trailing bytes that do not fill a word are
/// dropped.
#[must_use]
pub fn words_from_le_bytes(data: &[u8]) -> Vec<u32> {
    data.chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Serialize 32-bit words as little-endian bytes.
#[must_use]
pub fn words_to_le_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|word| word.to_le_bytes()).collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn xxtea_encrypt(v: &mut [u32], key: &[u32; 4]) {
        let n = v.len();
        if n < 2 {
            return;
        }

        let rounds = 6 + 52 / n as u32;
        let mut sum = 0u32;
        let mut z = v[n - 1];
        for _ in 0..rounds {
            sum = sum.wrapping_add(DELTA);
            let e = ((sum >> 2) & 3) as usize;
            for p in 0..n - 1 {
                let y = v[p + 1];
                v[p] = v[p].wrapping_add(xxtea_mx(z, y, sum, key, p, e));
                z = v[p];
            }
            let y = v[0];
            v[n - 1] = v[n - 1].wrapping_add(xxtea_mx(z, y, sum, key, n - 1, e));
            z = v[n - 1];
        }
    }

    pub(crate) fn xtea_encrypt(v0: &mut u32, v1: &mut u32, key: &[u32; 4], rounds: u32) {
        let mut sum = 0u32;
        for _ in 0..rounds {
            *v0 = v0.wrapping_add(
                ((*v1 << 4) ^ (*v1 >> 5)).wrapping_add(*v1)
                    ^ sum.wrapping_add(key[(sum & 3) as usize]),
            );
            sum = sum.wrapping_add(DELTA);
            *v1 = v1.wrapping_add(
                ((*v0 << 4) ^ (*v0 >> 5)).wrapping_add(*v0)
                    ^ sum.wrapping_add(key[((sum >> 11) & 3) as usize]),
            );
        }
    }

    const KEY: [u32; 4] = [0x0001_0203, 0x0405_0607, 0x0809_0A0B, 0x0C0D_0E0F];

    #[test]
    fn xxtea_vectors() {
        let mut zero = [0x0537_04AB, 0x575D_8C80];
        xxtea_decrypt(&mut zero, &[0; 4]);
        assert_eq!(zero, [0, 0]);

        let mut two = [0x93EF_FE61, 0xE8AC_D400];
        xxtea_decrypt(&mut two, &KEY);
        assert_eq!(two, [0, 0]);

        let mut five = [0x4988_8985, 0xA8EF_8396, 0x368A_448D, 0xE4BB_3B41, 0x054D_5D7F];
        xxtea_decrypt(&mut five, &KEY);
        assert_eq!(
            five,
            [0x0123_4567, 0x89AB_CDEF, 0xDEAD_BEEF, 0x0BAD_F00D, 0x1357_9BDF]
        );
    }

    #[test]
    fn xxtea_inverts_encrypt() {
        for n in 2..40u32 {
            let plain: Vec<u32> = (0..n).map(|i| i.wrapping_mul(0x0101_0101) ^ 0xA5A5_5A5A).collect();
            let mut data = plain.clone();
            xxtea_encrypt(&mut data, &KEY);
            assert_ne!(data, plain);
            xxtea_decrypt(&mut data, &KEY);
            assert_eq!(data, plain);
        }
    }

    #[test]
    fn xxtea_single_word_block() {
        let mut single = [0xDEAD_BEEF];
        xxtea_decrypt(&mut single, &[1, 2, 3, 4]);
        assert_eq!(single, [0x66D4_C400]);

        let mut zero = [0];
        xxtea_decrypt(&mut zero, &[0; 4]);
        assert_eq!(zero, [0x19BC_DF9E]);

        let mut empty: [u32; 0] = [];
        xxtea_decrypt(&mut empty, &KEY);
    }

    #[test]
    fn xtea_vectors() {
        let (mut v0, mut v1) = (0x497D_F3D0, 0x7261_2CB5);
        xtea_decrypt(&mut v0, &mut v1, &KEY, 32);
        assert_eq!((v0, v1), (0x4142_4344, 0x4546_4748));

        let (mut v0, mut v1) = (0x599C_1007, 0x2EF3_B192);
        xtea_decrypt(&mut v0, &mut v1, &[1, 2, 3, 4], 64);
        assert_eq!((v0, v1), (0x0123_4567, 0x89AB_CDEF));
    }

    #[test]
    fn xtea_inverts_encrypt() {
        for rounds in [1, 8, 16, 32, 33] {
            let (mut v0, mut v1) = (0xCAFE_BABE, 0x1234_5678);
            xtea_encrypt(&mut v0, &mut v1, &KEY, rounds);
            xtea_decrypt(&mut v0, &mut v1, &KEY, rounds);
            assert_eq!((v0, v1), (0xCAFE_BABE, 0x1234_5678));
        }
    }

    #[test]
    fn word_conversion() {
        let words = words_from_le_bytes(&[1, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF, 9]);
        assert_eq!(words, vec![1, u32::MAX]);
        assert_eq!(words_to_le_bytes(&words), vec![1, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF]);
    }
}
