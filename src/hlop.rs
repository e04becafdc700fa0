//! The closed set of high-level, type-polymorphic operations recognized by
//! this stage. The front end tags each external "operation" function with one
//! of these; every call to such a function is a lowering site.

macro_rules! hl_opcodes {
    ($($name:ident),+ $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum HlOp {
            $($name),+
        }
        impl HlOp {
            /// Every opcode, in declaration order. Exists so tests can sweep
            /// the whole set against the dispatch match.
            pub const ALL: &'static [HlOp] = &[$(HlOp::$name),+];

            pub const fn name(self) -> &'static str {
                match self {
                    $(Self::$name => stringify!($name)),+
                }
            }
        }
    };
}

hl_opcodes! {
    // trigonometric / transcendental, elementwise
    Acos, Asin, Atan, Cos, Sin, Tan, Cosh, Sinh, Tanh,
    Exp, Exp2, Log, Log2, Log10, Sqrt, Rsqrt, Frac,
    // rounding, elementwise
    Round, Floor, Ceil, Truncate,
    // float checks, elementwise
    IsNan, IsInf, IsFinite,
    // misc unary
    Saturate, Abs,
    // integer bit queries, elementwise (scalar result per lane)
    Countbits, Reversebits, FirstbitHi, FirstbitLo, FirstbitSHi,
    // binary, elementwise
    Min, Max, Pow,
    // tertiary, elementwise
    Mad, Lerp, Clamp,
    // geometry
    Dot, Cross, Length, Normalize, Distance, Reflect,
    // derivatives
    DdxCoarse, DdxFine, DdyCoarse, DdyFine, Fwidth,
    // reinterpret / precision casts
    Asfloat, Asint, Asuint, F16ToF32, F32ToF16,
    // packed-byte conversions
    Pack4x8, Unpack4x8,
    // 64-bit paired-uint arithmetic
    AddUint64,
    // resource handles and accesses
    CreateHandle, AnnotateHandle, Subscript, CBufSubscript,
    BufferLoad, BufferStore, GetDimensions, UpdateCounter,
    // matrix accesses over buffer memory
    MatSubscript, MatLoad, MatStore,
    // texture sampling / access
    Sample, SampleLevel, SampleGrad, SampleBias, SampleCmp, SampleCmpLevelZero,
    TexLoad, TexStore, CheckAccessFullyMapped,
    // interlocked operations
    InterlockedAdd, InterlockedAnd, InterlockedOr, InterlockedXor,
    InterlockedMin, InterlockedMax, InterlockedUMin, InterlockedUMax,
    InterlockedExchange, InterlockedCompareExchange, InterlockedCompareStore,
    // wave intrinsics
    WaveGetLaneCount, WaveGetLaneIndex, WaveIsFirstLane,
    WaveReadLaneAt, WaveReadLaneFirst,
    WaveActiveAnyTrue, WaveActiveAllTrue, WaveActiveBallot,
    WaveActiveSum, WaveActiveProduct, WaveActiveMin, WaveActiveMax,
    WaveActiveBitAnd, WaveActiveBitOr, WaveActiveBitXor,
    WavePrefixSum, WavePrefixProduct, WavePrefixCountBits,
    // quad intrinsics
    QuadReadAcrossX, QuadReadAcrossY, QuadReadAcrossDiagonal, QuadReadLaneAt,
    // barriers
    AllMemoryBarrier, AllMemoryBarrierWithGroupSync,
    DeviceMemoryBarrier, DeviceMemoryBarrierWithGroupSync,
    GroupMemoryBarrier, GroupMemoryBarrierWithGroupSync,
    // system value queries
    ThreadId, GroupId, ThreadIdInGroup, FlattenedThreadIdInGroup,
    // ray tracing
    TraceRay, ReportHit, CallShader, IgnoreHit, AcceptHitAndEndSearch,
    // mesh shaders
    SetMeshOutputCounts, DispatchMesh,
    // stream output (left for the signature legalization pass)
    EmitStream, CutStream,
    // recognized but not supported by this target
    Printf, SampleProj,
}

impl HlOp {
    /// Fixed operand arity, excluding any trailing optional original-value
    /// output (interlocked ops). `None` for the variadic-looking texture ops
    /// whose coordinate count depends on the resource kind.
    pub const fn arity(self) -> Option<usize> {
        match self {
            Self::Acos
            | Self::Asin
            | Self::Atan
            | Self::Cos
            | Self::Sin
            | Self::Tan
            | Self::Cosh
            | Self::Sinh
            | Self::Tanh
            | Self::Exp
            | Self::Exp2
            | Self::Log
            | Self::Log2
            | Self::Log10
            | Self::Sqrt
            | Self::Rsqrt
            | Self::Frac
            | Self::Round
            | Self::Floor
            | Self::Ceil
            | Self::Truncate
            | Self::IsNan
            | Self::IsInf
            | Self::IsFinite
            | Self::Saturate
            | Self::Abs
            | Self::Countbits
            | Self::Reversebits
            | Self::FirstbitHi
            | Self::FirstbitLo
            | Self::FirstbitSHi
            | Self::Length
            | Self::Normalize
            | Self::DdxCoarse
            | Self::DdxFine
            | Self::DdyCoarse
            | Self::DdyFine
            | Self::Fwidth
            | Self::Asfloat
            | Self::Asint
            | Self::Asuint
            | Self::F16ToF32
            | Self::F32ToF16
            | Self::Pack4x8
            | Self::Unpack4x8
            | Self::WaveActiveAnyTrue
            | Self::WaveActiveAllTrue
            | Self::WaveActiveBallot
            | Self::WaveActiveSum
            | Self::WaveActiveProduct
            | Self::WaveActiveMin
            | Self::WaveActiveMax
            | Self::WaveActiveBitAnd
            | Self::WaveActiveBitOr
            | Self::WaveActiveBitXor
            | Self::WavePrefixSum
            | Self::WavePrefixProduct
            | Self::WavePrefixCountBits
            | Self::QuadReadAcrossX
            | Self::QuadReadAcrossY
            | Self::QuadReadAcrossDiagonal
            | Self::WaveReadLaneFirst
            | Self::CheckAccessFullyMapped
            | Self::CBufSubscript
            | Self::ThreadId
            | Self::GroupId
            | Self::ThreadIdInGroup => Some(1),
            Self::Min
            | Self::Max
            | Self::Pow
            | Self::Dot
            | Self::Cross
            | Self::Distance
            | Self::Reflect
            | Self::AddUint64
            | Self::Subscript
            | Self::BufferLoad
            | Self::GetDimensions
            | Self::UpdateCounter
            | Self::WaveReadLaneAt
            | Self::QuadReadLaneAt
            | Self::MatSubscript
            | Self::MatLoad => Some(2),
            Self::Mad | Self::Lerp | Self::Clamp | Self::BufferStore | Self::MatStore => Some(3),
            Self::CreateHandle => Some(1),
            Self::AnnotateHandle => Some(3),
            Self::InterlockedAdd
            | Self::InterlockedAnd
            | Self::InterlockedOr
            | Self::InterlockedXor
            | Self::InterlockedMin
            | Self::InterlockedMax
            | Self::InterlockedUMin
            | Self::InterlockedUMax
            | Self::InterlockedExchange => Some(2),
            Self::InterlockedCompareExchange | Self::InterlockedCompareStore => Some(3),
            Self::WaveGetLaneCount
            | Self::WaveGetLaneIndex
            | Self::WaveIsFirstLane
            | Self::FlattenedThreadIdInGroup
            | Self::AllMemoryBarrier
            | Self::AllMemoryBarrierWithGroupSync
            | Self::DeviceMemoryBarrier
            | Self::DeviceMemoryBarrierWithGroupSync
            | Self::GroupMemoryBarrier
            | Self::GroupMemoryBarrierWithGroupSync
            | Self::IgnoreHit
            | Self::AcceptHitAndEndSearch => Some(0),
            Self::SetMeshOutputCounts => Some(2),
            Self::DispatchMesh => Some(4),
            Self::EmitStream | Self::CutStream => Some(1),
            Self::Sample
            | Self::SampleLevel
            | Self::SampleGrad
            | Self::SampleBias
            | Self::SampleCmp
            | Self::SampleCmpLevelZero
            | Self::TexLoad
            | Self::TexStore
            | Self::TraceRay
            | Self::ReportHit
            | Self::CallShader
            | Self::Printf
            | Self::SampleProj => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_is_duplicate_free() {
        let mut seen = std::collections::HashSet::new();
        for &op in HlOp::ALL {
            assert!(seen.insert(op), "duplicate opcode {op:?}");
        }
    }
}
