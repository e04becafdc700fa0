/// Source position carried through from the front end. Values created during
/// lowering inherit the location of the call they replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceLoc {
    pub line: u32,
    pub col: u32,
}
impl SourceLoc {
    pub const UNKNOWN: Self = Self { line: 0, col: 0 };

    #[inline]
    pub const fn new(line: u32, col: u32) -> Self {
        Self { line, col }
    }
}
impl core::fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}
