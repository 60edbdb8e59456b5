/// Widening conversions that cannot lose information on the supported platforms
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u32 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

impl SafeCast<usize> for u16 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

impl SafeCast<u64> for u32 {
    fn safe_cast(self) -> u64 {
        self as u64
    }
}


/// For narrowing casts where protocol logic ensures that the value is in the narrower type's range,
///  e.g. a fragment count that was checked against the receive window before.
///
/// NB: The implementations will panic otherwise
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}
impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        self.try_into().expect("this is a bug: protocol logic should have ensured the value range")
    }
}
impl PrecheckedCast<u16> for u32 {
    fn prechecked_cast(self) -> u16 {
        self.try_into().expect("this is a bug: protocol logic should have ensured the value range")
    }
}
impl PrecheckedCast<u8> for usize {
    fn prechecked_cast(self) -> u8 {
        self.try_into().expect("this is a bug: protocol logic should have ensured the value range")
    }
}
impl PrecheckedCast<i32> for i64 {
    fn prechecked_cast(self) -> i32 {
        self.try_into().expect("this is a bug: protocol logic should have ensured the value range")
    }
}
impl PrecheckedCast<u32> for i64 {
    fn prechecked_cast(self) -> u32 {
        self.try_into().expect("this is a bug: protocol logic should have ensured the value range")
    }
}

/// The engine runs on a 32 bit millisecond clock that is expected to wrap around, so this is
///  a deliberate truncation rather than a checked conversion
pub fn wrapping_millis(millis: u64) -> u32 {
    millis as u32
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::zero(0, 0)]
    #[case::small(1234, 1234)]
    #[case::max_u32(u32::MAX as u64, u32::MAX)]
    #[case::wrapped(u32::MAX as u64 + 5, 4)]
    fn test_wrapping_millis(#[case] millis: u64, #[case] expected: u32) {
        assert_eq!(wrapping_millis(millis), expected);
    }

    #[test]
    fn test_prechecked_in_range() {
        let frg: u8 = 127usize.prechecked_cast();
        assert_eq!(frg, 127);
        let wnd: u16 = 512u32.prechecked_cast();
        assert_eq!(wnd, 512);
        let rto: u32 = 60000i64.prechecked_cast();
        assert_eq!(rto, 60000);
    }

    #[test]
    #[should_panic]
    fn test_prechecked_out_of_range() {
        let _: u8 = 256usize.prechecked_cast();
    }
}
