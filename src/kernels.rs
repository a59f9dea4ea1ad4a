//! Device kernels for the sim accelerator.

use crate::compiler::program::{Precision, SliceLaunch};
use crate::device::{DeviceErrorCode, DeviceMemory, DevicePtr};

const F32_BYTES: usize = std::mem::size_of::<f32>();

/// Gather a strided window of a row-major f32 tensor into `dst`.
///
/// Element `i` of the output reads input index `starts + i * strides` per
/// axis. Buffers hold native-endian f32; `dst` is written densely.
pub fn strided_slice(
    memory: &mut DeviceMemory,
    src: DevicePtr,
    dst: DevicePtr,
    launch: &SliceLaunch,
    precision: Precision,
) -> Result<(), DeviceErrorCode> {
    let rank = launch.src_dims.len();
    if launch.out_dims.len() != rank || launch.starts.len() != rank || launch.strides.len() != rank {
        return Err(DeviceErrorCode::InvalidValue);
    }
    let src_elems: usize = launch.src_dims.iter().map(|&d| d as usize).product();
    let out_elems: usize = launch.out_dims.iter().map(|&d| d as usize).product();
    if out_elems == 0 {
        return Ok(());
    }

    // Row-major element strides of the source.
    let mut pitch = vec![1usize; rank];
    for axis in (0..rank.saturating_sub(1)).rev() {
        pitch[axis] = pitch[axis + 1] * launch.src_dims[axis + 1] as usize;
    }

    memory.with_src_dst(src, dst, |input, output| {
        if input.len() < src_elems * F32_BYTES || output.len() < out_elems * F32_BYTES {
            return Err(DeviceErrorCode::IllegalAddress);
        }
        if rank == 0 {
            copy_element(input, 0, output, 0, precision);
            return Ok(());
        }

        let inner = rank - 1;
        let row_len = launch.out_dims[inner] as usize;
        let row_step = launch.strides[inner] as usize;
        let mut index = vec![0usize; inner];
        let mut written = 0;
        while written < out_elems {
            let mut base = launch.starts[inner] as usize;
            for (axis, &i) in index.iter().enumerate() {
                base += (launch.starts[axis] as usize + i * launch.strides[axis] as usize) * pitch[axis];
            }
            for j in 0..row_len {
                let offset = base + j * row_step;
                if offset >= src_elems {
                    return Err(DeviceErrorCode::IllegalAddress);
                }
                copy_element(input, offset, output, written + j, precision);
            }
            written += row_len;

            // Odometer over the outer axes.
            for axis in (0..inner).rev() {
                index[axis] += 1;
                if index[axis] < launch.out_dims[axis] as usize {
                    break;
                }
                index[axis] = 0;
            }
        }
        Ok(())
    })
}

fn copy_element(input: &[u8], from: usize, output: &mut [u8], to: usize, precision: Precision) {
    let value: f32 = bytemuck::pod_read_unaligned(&input[from * F32_BYTES..(from + 1) * F32_BYTES]);
    let value = precision.round(value);
    output[to * F32_BYTES..(to + 1) * F32_BYTES].copy_from_slice(bytemuck::bytes_of(&value));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;

    fn launch(src_dims: Vec<u32>, starts: Vec<u32>, strides: Vec<u32>, out_dims: Vec<u32>) -> SliceLaunch {
        SliceLaunch {
            src: 0,
            dst: 1,
            src_dims,
            starts,
            strides,
            out_dims,
        }
    }

    fn run(values: &[f32], launch: &SliceLaunch, precision: Precision) -> Result<Vec<f32>, DeviceErrorCode> {
        let device = Device::with_capacity(1 << 20);
        let out_elems: usize = launch.out_dims.iter().map(|&d| d as usize).product();
        let src = device.malloc(values.len() * F32_BYTES).unwrap();
        let dst = device.malloc(out_elems.max(1) * F32_BYTES).unwrap();
        src.copy_from_host(bytemuck::cast_slice(values)).unwrap();

        let stream = device.create_stream().unwrap();
        let (src_ptr, dst_ptr, launch) = (src.ptr(), dst.ptr(), launch.clone());
        stream
            .launch(
                "strided_slice",
                Box::new(move |memory: &mut DeviceMemory| {
                    strided_slice(memory, src_ptr, dst_ptr, &launch, precision)
                }),
            )
            .unwrap();
        stream.synchronize().map_err(|err| err.code)?;

        let mut bytes = vec![0u8; out_elems * F32_BYTES];
        dst.copy_to_host(&mut bytes).unwrap();
        Ok(bytes
            .chunks_exact(F32_BYTES)
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }

    #[test]
    fn takes_every_other_row_and_column() {
        // 1x1x4x4 ramp -> 1x1x2x2
        let values: Vec<f32> = (0..16).map(|v| v as f32).collect();
        let slice = launch(vec![1, 1, 4, 4], vec![0; 4], vec![1, 1, 2, 2], vec![1, 1, 2, 2]);
        assert_eq!(run(&values, &slice, Precision::Fp32).unwrap(), vec![0.0, 2.0, 8.0, 10.0]);
    }

    #[test]
    fn honours_start_offsets_across_batches() {
        // 2x1x2x3 -> batch 1 only, last two columns
        let values: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let slice = launch(vec![2, 1, 2, 3], vec![1, 0, 0, 1], vec![1, 1, 1, 1], vec![1, 1, 2, 2]);
        assert_eq!(run(&values, &slice, Precision::Fp32).unwrap(), vec![7.0, 8.0, 10.0, 11.0]);
    }

    #[test]
    fn fp16_rounds_values() {
        let values = [1.0f32 / 3.0, 0.5];
        let slice = launch(vec![2], vec![0], vec![1], vec![2]);
        let out = run(&values, &slice, Precision::Fp16).unwrap();
        assert_eq!(out[1], 0.5);
        assert_ne!(out[0], values[0]);
        assert!(((out[0] - values[0]) / values[0]).abs() <= Precision::Fp16.relative_tolerance());
    }

    #[test]
    fn out_of_bounds_window_is_an_illegal_address() {
        let values = [0.0f32; 4];
        let slice = launch(vec![4], vec![2], vec![2], vec![2]);
        assert_eq!(run(&values, &slice, Precision::Fp32), Err(DeviceErrorCode::IllegalAddress));
    }
}
