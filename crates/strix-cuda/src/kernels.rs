// CUDA kernel source, compiled to PTX at device creation via NVRTC
//
// cuDNN does the normalization itself. The kernels here only cover what the
// batch-norm operators need around it:
// - strided → dense copies and dense → strided scatters, one kernel per
//   element width (neither interprets the bits, so F64 and I64 share the
//   64-bit variants)
// - float precision casts between the data dtype and the engine parameter
//   dtype, and back for running statistics and gradients
//
// F16 and BF16 live on the device as raw 16-bit words. Conversions go
// through F32, except F64 → F16/BF16 which round once from the double.

pub const KERNEL_SOURCE: &str = r#"
typedef unsigned short b16;
typedef unsigned int b32;
typedef unsigned long long b64;

__device__ __forceinline__ float load_f16(b16 bits) {
    float out;
    asm("{ cvt.f32.f16 %0, %1; }" : "=f"(out) : "h"(bits));
    return out;
}

__device__ __forceinline__ b16 store_f16(float v) {
    b16 out;
    asm("{ cvt.rn.f16.f32 %0, %1; }" : "=h"(out) : "f"(v));
    return out;
}

__device__ __forceinline__ float load_bf16(b16 bits) {
    return __uint_as_float(((b32)bits) << 16);
}

// Round to nearest even; NaN keeps a quiet payload.
__device__ __forceinline__ b16 store_bf16(float v) {
    b32 bits = __float_as_uint(v);
    if ((bits & 0x7fffffffu) > 0x7f800000u) {
        return (b16)((bits >> 16) | 0x40u);
    }
    return (b16)((bits + 0x7fffu + ((bits >> 16) & 1u)) >> 16);
}

__device__ __forceinline__ b16 store_f16_exact(double v) {
    b16 out;
    asm("{ cvt.rn.f16.f64 %0, %1; }" : "=h"(out) : "d"(v));
    return out;
}

// Truncate to F32 and set the sticky bit when inexact (round to odd), so
// the final round to nearest even matches a single rounding of `v`.
__device__ __forceinline__ b16 store_bf16_exact(double v) {
    float f = __double2float_rz(v);
    b32 bits = __float_as_uint(f);
    if (!isnan(v) && (double)f != v) bits |= 1u;
    return store_bf16(__uint_as_float(bits));
}

__device__ __forceinline__ double load_f64_exact(double v) { return v; }
__device__ __forceinline__ float load_f32(float v) { return v; }
__device__ __forceinline__ float store_f32(float v) { return v; }
__device__ __forceinline__ float load_f64(double v) { return (float)v; }
__device__ __forceinline__ double store_f64(float v) { return (double)v; }

__device__ __forceinline__ b64 storage_index(
    b64 i, const b64* dims, const b64* strides, b64 offset, int rank
) {
    b64 at = offset;
    for (int d = rank - 1; d >= 0; --d) {
        at += (i % dims[d]) * strides[d];
        i /= dims[d];
    }
    return at;
}

#define DENSIFY(name, T) \
extern "C" __global__ void name( \
    const T* src, T* dst, \
    const b64* dims, const b64* strides, \
    b64 offset, int rank, b64 n \
) { \
    b64 i = (b64)blockIdx.x * blockDim.x + threadIdx.x; \
    if (i >= n) return; \
    dst[i] = src[storage_index(i, dims, strides, offset, rank)]; \
}

#define SCATTER(name, T) \
extern "C" __global__ void name( \
    const T* src, T* dst, \
    const b64* dims, const b64* strides, \
    b64 offset, int rank, b64 n \
) { \
    b64 i = (b64)blockIdx.x * blockDim.x + threadIdx.x; \
    if (i >= n) return; \
    dst[storage_index(i, dims, strides, offset, rank)] = src[i]; \
}

DENSIFY(densify_b16, b16)
DENSIFY(densify_b32, b32)
DENSIFY(densify_b64, b64)
SCATTER(scatter_b16, b16)
SCATTER(scatter_b32, b32)
SCATTER(scatter_b64, b64)

#define CAST(name, FROM, LOAD, TO, STORE) \
extern "C" __global__ void name(const FROM* src, TO* dst, b64 n) { \
    b64 i = (b64)blockIdx.x * blockDim.x + threadIdx.x; \
    if (i < n) dst[i] = STORE(LOAD(src[i])); \
}

CAST(cast_f16_f32, b16, load_f16, float, store_f32)
CAST(cast_f32_f16, float, load_f32, b16, store_f16)
CAST(cast_bf16_f32, b16, load_bf16, float, store_f32)
CAST(cast_f32_bf16, float, load_f32, b16, store_bf16)
CAST(cast_f64_f32, double, load_f64, float, store_f32)
CAST(cast_f32_f64, float, load_f32, double, store_f64)
CAST(cast_f64_f16, double, load_f64_exact, b16, store_f16_exact)
CAST(cast_f64_bf16, double, load_f64_exact, b16, store_bf16_exact)
"#;

/// Kernel names loaded from the PTX module. Must match the extern "C" names above.
pub const KERNEL_NAMES: &[&str] = &[
    "densify_b16",
    "densify_b32",
    "densify_b64",
    "scatter_b16",
    "scatter_b32",
    "scatter_b64",
    "cast_f16_f32",
    "cast_f32_f16",
    "cast_bf16_f32",
    "cast_f32_bf16",
    "cast_f64_f32",
    "cast_f32_f64",
    "cast_f64_f16",
    "cast_f64_bf16",
];

pub const MODULE_NAME: &str = "strix_kernels";
