#[inline(always)]
pub const fn roundup2(x: u32, a: u32) -> u32 {
    (x + (a - 1)) & !(a - 1)
}

/// Round-to-nearest-even conversion of an f32 to IEEE binary16 bits.
pub fn f32_to_f16_bits(x: f32) -> u16 {
    let bits = x.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exp = ((bits >> 23) & 0xff) as i32;
    let man = bits & 0x007f_ffff;

    if exp == 0xff {
        // inf / nan, keep a nan payload bit
        return sign | 0x7c00 | if man != 0 { 0x0200 } else { 0 };
    }
    let e = exp - 127 + 15;
    if e >= 0x1f {
        return sign | 0x7c00;
    }
    if e <= 0 {
        if e < -10 {
            return sign;
        }
        // subnormal half
        let m = (man | 0x0080_0000) >> (1 - e);
        let rounded = (m + 0x0fff + ((m >> 13) & 1)) >> 13;
        return sign | rounded as u16;
    }
    let rounded = man + 0x0fff + ((man >> 13) & 1);
    if rounded & 0x0080_0000 != 0 {
        // mantissa overflow carries into the exponent
        return sign | (((e as u32 + 1) << 10) as u16);
    }
    sign | ((e as u32) << 10) as u16 | (rounded >> 13) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f16_bits_of_common_values() {
        assert_eq!(f32_to_f16_bits(0.0), 0x0000);
        assert_eq!(f32_to_f16_bits(1.0), 0x3c00);
        assert_eq!(f32_to_f16_bits(-2.0), 0xc000);
        assert_eq!(f32_to_f16_bits(f32::INFINITY), 0x7c00);
        assert_ne!(f32_to_f16_bits(f32::NAN) & 0x03ff, 0);
    }

    #[test]
    fn roundup2_aligns_to_register_boundaries() {
        assert_eq!(roundup2(0, 16), 0);
        assert_eq!(roundup2(1, 16), 16);
        assert_eq!(roundup2(16, 16), 16);
        assert_eq!(roundup2(17, 16), 32);
        assert_eq!(roundup2(12, 4), 12);
    }
}
