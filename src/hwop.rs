//! The fixed, fully-typed hardware operation set produced by lowering, plus
//! the capability queries that gate which forms may be emitted. A hardware
//! operation call always carries its numeric opcode constant as the first
//! operand.

use crate::concrete_type::ScalarType;

macro_rules! hw_opcodes {
    ($($name:ident = $code:expr),+ $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum HwOp {
            $($name),+
        }
        impl HwOp {
            /// The numeric opcode constant emitted as operand 0.
            pub const fn code(self) -> u32 {
                match self {
                    $(Self::$name => $code),+
                }
            }

            pub const fn name(self) -> &'static str {
                match self {
                    $(Self::$name => stringify!($name)),+
                }
            }
        }
    };
}

hw_opcodes! {
    Acos = 15, Asin = 16, Atan = 17,
    Cos = 12, Sin = 13, Tan = 14,
    Hcos = 18, Hsin = 19, Htan = 20,
    Exp = 21, Frc = 22, Log = 23,
    Sqrt = 24, Rsqrt = 25,
    RoundNe = 26, RoundNi = 27, RoundPi = 28, RoundZ = 29,
    FAbs = 6, Saturate = 7,
    IsNaN = 8, IsInf = 9, IsFinite = 10,
    Bfrev = 30, Countbits = 31, FirstbitLo = 32, FirstbitHi = 33, FirstbitSHi = 34,
    FMax = 35, FMin = 36, IMax = 37, IMin = 38, UMax = 39, UMin = 40,
    FMad = 46, IMad = 48, UMad = 49,
    Dot2 = 54, Dot3 = 55, Dot4 = 56,
    CreateHandle = 57,
    CBufLoad = 58, CBufLoadLegacy = 59,
    Sample = 60, SampleBias = 61, SampleLevel = 62, SampleGrad = 63,
    SampleCmp = 64, SampleCmpLevelZero = 65,
    TextureLoad = 66, TextureStore = 67,
    BufLoad = 68, BufStore = 69,
    UpdateCounter = 70, CheckAccessFullyMapped = 71, GetDimensions = 72,
    AtomicBinOp = 78, AtomicCompareExchange = 79,
    Barrier = 80,
    DerivCoarseX = 83, DerivCoarseY = 84, DerivFineX = 85, DerivFineY = 86,
    ThreadId = 93, GroupId = 94, ThreadIdInGroup = 95, FlattenedThreadIdInGroup = 96,
    EmitStream = 97, CutStream = 98,
    MakeDouble = 101, SplitDouble = 102,
    LegacyF32ToF16 = 130, LegacyF16ToF32 = 131,
    WaveIsFirstLane = 110, WaveGetLaneIndex = 111, WaveGetLaneCount = 112,
    WaveReadLaneAt = 117, WaveReadLaneFirst = 118,
    WaveAnyTrue = 113, WaveAllTrue = 114, WaveActiveBallot = 116,
    WaveActiveOp = 119, WaveActiveBit = 120,
    WavePrefixOp = 121, WavePrefixCountBits = 136,
    QuadReadLaneAt = 122, QuadOp = 123,
    BitcastI16toF16 = 124, BitcastF16toI16 = 125,
    Pack4x8 = 220, Unpack4x8 = 219,
    RawBufLoad = 139, RawBufStore = 140,
    TraceRay = 157, ReportHit = 158, CallShader = 159,
    IgnoreHit = 155, AcceptHitAndEndSearch = 156,
    SetMeshOutputCounts = 168, DispatchMesh = 173,
    AnnotateHandle = 216,
}

impl HwOp {
    /// Whether the operation maps lanes independently, making it eligible for
    /// either the scalarized path or (capability permitting) a single
    /// native-vector call.
    pub const fn is_elementwise(self) -> bool {
        matches!(
            self,
            Self::Acos
                | Self::Asin
                | Self::Atan
                | Self::Cos
                | Self::Sin
                | Self::Tan
                | Self::Hcos
                | Self::Hsin
                | Self::Htan
                | Self::Exp
                | Self::Frc
                | Self::Log
                | Self::Sqrt
                | Self::Rsqrt
                | Self::RoundNe
                | Self::RoundNi
                | Self::RoundPi
                | Self::RoundZ
                | Self::FAbs
                | Self::Saturate
                | Self::IsNaN
                | Self::IsInf
                | Self::IsFinite
                | Self::Bfrev
                | Self::Countbits
                | Self::FirstbitLo
                | Self::FirstbitHi
                | Self::FirstbitSHi
                | Self::FMax
                | Self::FMin
                | Self::IMax
                | Self::IMin
                | Self::UMax
                | Self::UMin
                | Self::FMad
                | Self::IMad
                | Self::UMad
                | Self::DerivCoarseX
                | Self::DerivCoarseY
                | Self::DerivFineX
                | Self::DerivFineY
                | Self::LegacyF32ToF16
                | Self::LegacyF16ToF32
        )
    }

    /// Legal scalar overloads for the elementwise group; structural ops are
    /// validated at their dedicated emission sites instead.
    pub fn valid_overload(self, s: ScalarType) -> bool {
        match self {
            Self::Acos
            | Self::Asin
            | Self::Atan
            | Self::Cos
            | Self::Sin
            | Self::Tan
            | Self::Hcos
            | Self::Hsin
            | Self::Htan
            | Self::Exp
            | Self::Frc
            | Self::Log
            | Self::Sqrt
            | Self::Rsqrt
            | Self::RoundNe
            | Self::RoundNi
            | Self::RoundPi
            | Self::RoundZ
            | Self::FAbs
            | Self::Saturate
            | Self::FMax
            | Self::FMin
            | Self::FMad
            | Self::DerivCoarseX
            | Self::DerivCoarseY
            | Self::DerivFineX
            | Self::DerivFineY => s.is_float(),
            Self::IsNaN | Self::IsInf | Self::IsFinite => s.is_float(),
            Self::Bfrev
            | Self::Countbits
            | Self::FirstbitLo
            | Self::FirstbitHi
            | Self::FirstbitSHi
            | Self::IMax
            | Self::IMin
            | Self::UMax
            | Self::UMin
            | Self::IMad
            | Self::UMad => !s.is_float() && !matches!(s, ScalarType::Bool),
            _ => true,
        }
    }
}

bitflags::bitflags! {
    /// Per-call component selection for buffer/texture load and store
    /// operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ComponentMask: u8 {
        const X = 0b0001;
        const Y = 0b0010;
        const Z = 0b0100;
        const W = 0b1000;
    }
}
impl ComponentMask {
    /// The first `n` components.
    pub fn first(n: u32) -> Self {
        Self::from_bits_truncate((1u8 << n.min(4)) - 1)
    }

    pub fn lane_count(self) -> u32 {
        self.bits().count_ones()
    }
}

bitflags::bitflags! {
    /// Semantic flags of the barrier hardware operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BarrierMode: u32 {
        const SYNC_THREAD_GROUP = 0b0001;
        const UAV_FENCE_GLOBAL = 0b0010;
        const TGSM_FENCE = 0b1000;
    }
}

/// Selector constant carried by `HwOp::AtomicBinOp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtomicKind {
    Add = 0,
    And = 1,
    Or = 2,
    Xor = 3,
    IMin = 4,
    IMax = 5,
    UMin = 6,
    UMax = 7,
    Exchange = 8,
}

/// Selector constant carried by `WaveActiveOp` / `WavePrefixOp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaveOpKind {
    Sum = 0,
    Product = 1,
    Min = 2,
    Max = 3,
}

/// Selector constant carried by `WaveActiveBit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaveBitKind {
    And = 0,
    Or = 1,
    Xor = 2,
}

/// Selector constant carried by `QuadOp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuadOpKind {
    ReadAcrossX = 0,
    ReadAcrossY = 1,
    ReadAcrossDiagonal = 2,
}

/// Capability view of the compilation target. Queried, never mutated, during
/// a lowering run.
#[derive(Debug, Clone)]
pub struct Target {
    pub shader_model: (u32, u32),
    /// Native vector overloads for elementwise operations.
    pub native_vectors: bool,
    /// Native 64-bit integer arithmetic; without it, paired-uint emulation is
    /// emitted.
    pub native_i64: bool,
    /// 64-bit atomics capability.
    pub atomic_i64: bool,
    /// Constant buffers addressed with the legacy 16-byte-register scheme
    /// instead of linear byte offsets.
    pub legacy_cbuf_layout: bool,
}
impl Default for Target {
    fn default() -> Self {
        Self {
            shader_model: (6, 0),
            native_vectors: false,
            native_i64: true,
            atomic_i64: false,
            legacy_cbuf_layout: true,
        }
    }
}
impl Target {
    pub fn is_sm_at_least(&self, major: u32, minor: u32) -> bool {
        self.shader_model >= (major, minor)
    }

    pub fn supports_native_vector(&self, op: HwOp, elem: ScalarType) -> bool {
        self.native_vectors
            && self.is_sm_at_least(6, 9)
            && op.is_elementwise()
            && op.valid_overload(elem)
    }

    pub fn supports_atomic(&self, elem: ScalarType) -> bool {
        match elem {
            ScalarType::SInt32 | ScalarType::UInt32 => true,
            ScalarType::SInt64 | ScalarType::UInt64 => self.atomic_i64,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_mask_first() {
        assert_eq!(ComponentMask::first(1), ComponentMask::X);
        assert_eq!(
            ComponentMask::first(3),
            ComponentMask::X | ComponentMask::Y | ComponentMask::Z
        );
        assert_eq!(ComponentMask::first(4), ComponentMask::all());
        assert_eq!(ComponentMask::first(3).lane_count(), 3);
    }

    #[test]
    fn native_vector_gate_requires_capability_and_shape() {
        let mut t = Target::default();
        assert!(!t.supports_native_vector(HwOp::Sin, ScalarType::Float));
        t.native_vectors = true;
        t.shader_model = (6, 9);
        assert!(t.supports_native_vector(HwOp::Sin, ScalarType::Float));
        // structural ops never take the native-vector path
        assert!(!t.supports_native_vector(HwOp::RawBufLoad, ScalarType::Float));
        // invalid overload is rejected even when capable
        assert!(!t.supports_native_vector(HwOp::Sin, ScalarType::UInt32));
    }
}
