pub trait FloatExt {
    fn approximately_eq(self, other: Self) -> bool;
}

impl FloatExt for f64 {
    fn approximately_eq(self, other: Self) -> bool {
        (self - other).abs() < crate::EPSILON
    }
}
