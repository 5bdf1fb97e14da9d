//! WGSL sources for the convolution compute pipeline.

/// One invocation per output element. Workgroups are `1x1x1` and the grid is
/// `(width, height, depth)` of the output.
pub const SEPARABLE_CONVOLUTION: &str = r#"
struct ShaderInfo {
    input_size: vec4<i32>,
    input_stride: vec4<i32>,
    vertical_size: vec4<i32>,
    vertical_stride: vec4<i32>,
    horizontal_size: vec4<i32>,
    horizontal_stride: vec4<i32>,
    output_size: vec4<i32>,
    output_stride: vec4<i32>,
    filter_size: i32,
    _pad0: i32,
    _pad1: i32,
    _pad2: i32,
}

@group(0) @binding(0) var<storage, read> src: array<f32>;
@group(0) @binding(1) var<storage, read_write> dst: array<f32>;
@group(0) @binding(2) var<storage, read> kernel_v: array<f32>;
@group(0) @binding(3) var<storage, read> kernel_h: array<f32>;
@group(0) @binding(4) var<uniform> info: ShaderInfo;

@compute @workgroup_size(1, 1, 1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let x = i32(id.x);
    let y = i32(id.y);
    let c = i32(id.z);
    if (x >= info.output_size.w || y >= info.output_size.z || c >= info.output_size.y) {
        return;
    }

    let v_stride = info.vertical_stride;
    let h_stride = info.horizontal_stride;
    let in_stride = info.input_stride;
    let kernel_px_v = y * v_stride.z + x * v_stride.w;
    let kernel_px_h = y * h_stride.z + x * h_stride.w;
    let plane = c * in_stride.y;

    var acc: f32 = 0.0;
    for (var i: i32 = 0; i < info.filter_size; i = i + 1) {
        let v = kernel_v[i * v_stride.y + kernel_px_v];
        let row = plane + (y + i) * in_stride.z;
        var row_acc: f32 = 0.0;
        for (var j: i32 = 0; j < info.filter_size; j = j + 1) {
            row_acc = row_acc + kernel_h[j * h_stride.y + kernel_px_h] * src[row + (x + j) * in_stride.w];
        }
        acc = acc + v * row_acc;
    }

    let out_stride = info.output_stride;
    dst[c * out_stride.y + y * out_stride.z + x * out_stride.w] = acc;
}
"#;
