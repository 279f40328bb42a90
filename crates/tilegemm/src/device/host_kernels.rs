//! Host implementations of the device programs, used by the reference
//! device. Memory objects are stored as 32-bit words; image reads clamp
//! to the edge like a `CLK_ADDRESS_CLAMP_TO_EDGE` sampler.

use std::collections::HashMap;

use crate::dispatch::{LOCAL_SIZE, ROWS_PER_LANE, VECTOR_GLOBAL_SIZE, VECTOR_LOCAL_SIZE};
use crate::element::ElementKind;
use crate::image::{DeviceImage, ImageDesc, ImageId};
use crate::kernels;
use crate::variant::{BRead, KernelKey, KernelTable, Transpose};

use super::{BufferId, DeviceBuffer, KernelArg, KernelLaunch};

/// Outcome of a host kernel; the error text is logged and the command's
/// event fails.
pub(crate) type KernelResult = Result<(), String>;

/// OpenCL `CL_INVALID_KERNEL_ARGS`.
pub(crate) const INVALID_KERNEL_ARGS: i32 = -52;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HostKernel {
    CopyNoTranspose,
    CopyTranspose,
    Gemm(KernelKey),
    MatvecMul4,
    MatvecMul1,
    Axpy,
    Fill(ElementKind),
}

/// Every program the reference device can run, by kernel name.
pub(crate) fn builtin_programs() -> HashMap<String, HostKernel> {
    let mut programs: HashMap<String, HostKernel> = KernelTable::builtin()
        .iter()
        .map(|(key, id)| (id.name().to_string(), HostKernel::Gemm(*key)))
        .collect();
    programs.insert(kernels::COPY_IMAGE_NO_TRANSPOSE.into(), HostKernel::CopyNoTranspose);
    programs.insert(kernels::COPY_IMAGE_TRANSPOSE.into(), HostKernel::CopyTranspose);
    let f32k = ElementKind::F32;
    programs.insert(kernels::matvec_mul4(f32k).name().into(), HostKernel::MatvecMul4);
    programs.insert(kernels::matvec_mul1(f32k).name().into(), HostKernel::MatvecMul1);
    programs.insert(kernels::axpy(f32k).name().into(), HostKernel::Axpy);
    for kind in [ElementKind::F32, ElementKind::I32] {
        programs.insert(kernels::fill(kind).name().into(), HostKernel::Fill(kind));
    }
    programs
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct HostImage {
    pub desc: ImageDesc,
    pub texels: Vec<u32>,
}

impl HostImage {
    pub fn new(desc: ImageDesc) -> Self {
        Self {
            desc,
            texels: vec![0; desc.texels()],
        }
    }

    fn read(&self, x: usize, y: usize) -> u32 {
        let x = x.min(self.desc.width - 1);
        let y = y.min(self.desc.height - 1);
        self.texels[y * self.desc.width + x]
    }

    fn read_f32(&self, x: usize, y: usize) -> f32 {
        f32::from_bits(self.read(x, y))
    }

    fn write(&mut self, x: usize, y: usize, word: u32) {
        self.texels[y * self.desc.width + x] = word;
    }
}

#[derive(Debug, Default)]
pub(crate) struct Storage {
    pub buffers: HashMap<BufferId, Vec<u32>>,
    pub images: HashMap<ImageId, HostImage>,
}

impl Storage {
    fn buffer(&self, buffer: &DeviceBuffer) -> Result<&Vec<u32>, String> {
        self.buffers
            .get(&buffer.id)
            .ok_or_else(|| format!("buffer {} is not allocated", buffer.id))
    }

    fn image_mut(&mut self, image: &DeviceImage) -> Result<&mut HostImage, String> {
        self.images
            .get_mut(&image.id)
            .ok_or_else(|| format!("image {} is not allocated", image.id))
    }
}

fn check_span(what: &str, len: usize, offset: usize, width: usize, height: usize, ld: usize) -> KernelResult {
    if width == 0 || height == 0 {
        return Ok(());
    }
    let end = offset + (height - 1) * ld + width;
    if end > len {
        return Err(format!("{what}: access up to element {end} exceeds length {len}"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Argument decoding
// ---------------------------------------------------------------------------

struct Args<'a> {
    kernel: &'a str,
    args: &'a [KernelArg],
    pos: usize,
}

impl<'a> Args<'a> {
    fn new(launch: &'a KernelLaunch) -> Self {
        Self {
            kernel: launch.kernel.name(),
            args: &launch.args,
            pos: 0,
        }
    }

    fn next(&mut self, expected: &str) -> Result<&'a KernelArg, String> {
        let arg = self
            .args
            .get(self.pos)
            .ok_or_else(|| format!("{}: missing argument {} ({expected})", self.kernel, self.pos))?;
        self.pos += 1;
        Ok(arg)
    }

    fn mismatch(&self, expected: &str, got: &KernelArg) -> String {
        format!(
            "{}: argument {} expected {expected}, got {got:?}",
            self.kernel,
            self.pos - 1
        )
    }

    fn buffer(&mut self) -> Result<&'a DeviceBuffer, String> {
        match self.next("buffer")? {
            KernelArg::Buffer(b) => Ok(b),
            other => Err(self.mismatch("buffer", other)),
        }
    }

    fn image(&mut self) -> Result<&'a DeviceImage, String> {
        match self.next("image")? {
            KernelArg::Image(i) => Ok(i),
            other => Err(self.mismatch("image", other)),
        }
    }

    /// A non-negative `int` argument.
    fn index(&mut self) -> Result<usize, String> {
        match self.next("index")? {
            KernelArg::Int(v) if *v >= 0 => Ok(*v as usize),
            other => Err(self.mismatch("non-negative integer", other)),
        }
    }

    fn float(&mut self) -> Result<f32, String> {
        match self.next("float")? {
            KernelArg::Float(v) => Ok(*v),
            other => Err(self.mismatch("float", other)),
        }
    }

    fn int(&mut self) -> Result<i32, String> {
        match self.next("int")? {
            KernelArg::Int(v) => Ok(*v),
            other => Err(self.mismatch("int", other)),
        }
    }

    fn local(&mut self) -> Result<usize, String> {
        match self.next("local")? {
            KernelArg::Local(bytes) => Ok(*bytes),
            other => Err(self.mismatch("local memory", other)),
        }
    }

    fn finish(self) -> KernelResult {
        if self.pos != self.args.len() {
            return Err(format!(
                "{}: {} arguments bound, kernel takes {}",
                self.kernel,
                self.args.len(),
                self.pos
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

pub(crate) fn execute(kernel: HostKernel, storage: &mut Storage, launch: &KernelLaunch) -> KernelResult {
    match kernel {
        HostKernel::CopyNoTranspose => copy_to_image(storage, launch, true),
        HostKernel::CopyTranspose => copy_to_image(storage, launch, false),
        HostKernel::Gemm(key) => gemm(&key, storage, launch),
        HostKernel::MatvecMul4 => matvec(storage, launch, false),
        HostKernel::MatvecMul1 => matvec(storage, launch, true),
        HostKernel::Axpy => axpy(storage, launch),
        HostKernel::Fill(kind) => fill(kind, storage, launch),
    }
}

/// Plain region copy of contiguous rows into the image's top-left corner.
pub(crate) fn copy_region(
    storage: &mut Storage,
    src: &DeviceBuffer,
    src_offset: usize,
    dst: &DeviceImage,
    region: [usize; 2],
) -> KernelResult {
    let [width, height] = region;
    let words = storage.buffer(src)?;
    check_span("copy_buffer_to_image source", words.len(), src_offset, width, height, width)?;
    let rows: Vec<u32> = words[src_offset..src_offset + width * height].to_vec();
    let image = storage.image_mut(dst)?;
    if width > image.desc.width || height > image.desc.height {
        return Err(format!(
            "copy region {width}x{height} exceeds image {}x{}",
            image.desc.width, image.desc.height
        ));
    }
    for y in 0..height {
        for x in 0..width {
            image.write(x, y, rows[y * width + x]);
        }
    }
    Ok(())
}

/// Strided copy; texels outside `width × height` but inside the global
/// range are zero when `zero_fill` is set.
fn copy_to_image(storage: &mut Storage, launch: &KernelLaunch, zero_fill: bool) -> KernelResult {
    let mut args = Args::new(launch);
    let src = args.buffer()?;
    let dst = args.image()?;
    let offset = args.index()?;
    let width = args.index()?;
    let height = args.index()?;
    let ld = args.index()?;
    args.finish()?;

    let [gw, gh] = global_2d(launch)?;
    if !zero_fill && (gw != width || gh != height) {
        return Err(format!("scalar copy global {gw}x{gh} differs from region {width}x{height}"));
    }
    let words = storage.buffer(src)?;
    check_span("staging source", words.len(), offset, width, height, ld)?;
    let mut values = vec![0u32; gw * gh];
    for y in 0..gh.min(height) {
        for x in 0..gw.min(width) {
            values[y * gw + x] = words[offset + y * ld + x];
        }
    }
    let image = storage.image_mut(dst)?;
    if gw > image.desc.width || gh > image.desc.height {
        return Err(format!(
            "copy range {gw}x{gh} exceeds image {}x{}",
            image.desc.width, image.desc.height
        ));
    }
    for y in 0..gh {
        for x in 0..gw {
            image.write(x, y, values[y * gw + x]);
        }
    }
    Ok(())
}

fn global_2d(launch: &KernelLaunch) -> Result<[usize; 2], String> {
    match launch.global.as_slice() {
        [x, y] => Ok([*x, *y]),
        other => Err(format!("{}: expected 2-D global size, got {other:?}", launch.kernel.name())),
    }
}

fn check_local(launch: &KernelLaunch, expected: &[usize]) -> KernelResult {
    match &launch.local {
        Some(local) if local.as_slice() == expected => Ok(()),
        other => Err(format!(
            "{}: local size {other:?}, expected {expected:?}",
            launch.kernel.name()
        )),
    }
}

enum BArg<'a> {
    Image(&'a DeviceImage),
    Buffer(&'a DeviceBuffer, usize, usize),
}

enum BSource<'a> {
    Image(&'a HostImage),
    Buffer { words: &'a [u32], offset: usize, ld: usize },
}

fn gemm(key: &KernelKey, storage: &mut Storage, launch: &KernelLaunch) -> KernelResult {
    let mut args = Args::new(launch);
    let a = args.image()?;
    let b_arg = if key.b_read.reads_image() {
        BArg::Image(args.image()?)
    } else {
        BArg::Buffer(args.buffer()?, args.index()?, args.index()?)
    };
    let c = args.buffer()?;
    let c_offset = args.index()?;
    let height = args.index()?;
    let width = args.index()?;
    let ldc = args.index()?;
    let alpha = args.float()?;
    let beta = args.float()?;
    let padded_k = args.index()?;
    let block_k = if key.b_read.trans_b().is_trans() {
        args.index()?
    } else {
        padded_k
    };
    let first = args.index()? != 0;
    args.finish()?;

    let [gx, gy] = global_2d(launch)?;
    check_local(launch, &LOCAL_SIZE)?;
    if gx * key.shape.columns_per_lane() < width || gy * ROWS_PER_LANE < height {
        return Err(format!(
            "{}: global {gx}x{gy} does not cover a {width}x{height} tile",
            launch.kernel.name()
        ));
    }

    let Storage { buffers, images } = storage;
    let a_img = images.get(&a.id).ok_or_else(|| format!("image {} is not allocated", a.id))?;
    let b = match b_arg {
        BArg::Image(img) => BSource::Image(
            images
                .get(&img.id)
                .ok_or_else(|| format!("image {} is not allocated", img.id))?,
        ),
        BArg::Buffer(buf, offset, ld) => {
            if buf.id == c.id {
                return Err("B and C alias the same buffer".into());
            }
            let words = buffers
                .get(&buf.id)
                .ok_or_else(|| format!("buffer {} is not allocated", buf.id))?;
            check_span("B", words.len(), offset, block_k, width, ld)?;
            BSource::Buffer { words, offset, ld }
        }
    };
    let out = buffers
        .get(&c.id)
        .ok_or_else(|| format!("buffer {} is not allocated", c.id))?;
    check_span("C", out.len(), c_offset, width, height, ldc)?;

    let a_at = |i: usize, k: usize| match key.trans_a {
        Transpose::NoTrans => a_img.read_f32(k, i),
        Transpose::Trans => a_img.read_f32(i, k),
    };
    let b_at = |k: usize, j: usize| match (&b, key.b_read) {
        (BSource::Image(img), BRead::Blocked) => img.read_f32(j, k),
        (BSource::Image(img), _) => img.read_f32(k, j),
        (&BSource::Buffer { words, offset, ld }, _) => f32::from_bits(words[offset + j * ld + k]),
    };

    let mut results = Vec::with_capacity(width * height);
    for i in 0..height {
        for j in 0..width {
            let mut acc = 0.0f32;
            for k in 0..block_k {
                acc += a_at(i, k) * b_at(k, j);
            }
            let scaled = if key.alpha_one { acc } else { alpha * acc };
            let idx = c_offset + i * ldc + j;
            let old = f32::from_bits(out[idx]);
            let value = match (first, key.beta_zero) {
                (true, true) => scaled,
                (true, false) => scaled + beta * old,
                (false, _) => old + scaled,
            };
            results.push((idx, value.to_bits()));
        }
    }

    let out = buffers
        .get_mut(&c.id)
        .ok_or_else(|| format!("buffer {} is not allocated", c.id))?;
    for (idx, word) in results {
        out[idx] = word;
    }
    Ok(())
}

fn vector_global(launch: &KernelLaunch) -> Result<usize, String> {
    check_local(launch, &[VECTOR_LOCAL_SIZE])?;
    match launch.global.as_slice() {
        [g] if g % VECTOR_LOCAL_SIZE == 0 => Ok(*g),
        other => Err(format!("{}: bad global size {other:?}", launch.kernel.name())),
    }
}

/// `y[r] = alpha * dot(A[r, :], x) + beta * y[r]` for the launched rows.
fn matvec(storage: &mut Storage, launch: &KernelLaunch, single_rows: bool) -> KernelResult {
    let mut args = Args::new(launch);
    let a = args.buffer()?;
    let a_offset = args.index()?;
    let cols = args.index()?;
    let row_offset = if single_rows { args.index()? } else { 0 };
    let tail = args.index()?;
    let x = args.buffer()?;
    let x_offset = args.index()?;
    let alpha = args.float()?;
    let beta = args.float()?;
    let y = args.buffer()?;
    let y_offset = args.index()?;
    let _local = args.local()?;
    args.finish()?;
    if tail != cols % 4 {
        return Err(format!("column remainder {tail} does not match {cols} columns"));
    }
    if y.id == a.id || y.id == x.id {
        return Err("output vector aliases an input".into());
    }

    let groups = vector_global(launch)? / VECTOR_LOCAL_SIZE;
    let rows = if single_rows { groups } else { groups * 4 };
    let a_words = storage.buffer(a)?;
    let x_words = storage.buffer(x)?;
    check_span("A", a_words.len(), a_offset, cols, row_offset + rows, cols)?;
    check_span("x", x_words.len(), x_offset, cols, 1, cols)?;

    let sums: Vec<f32> = (row_offset..row_offset + rows)
        .map(|r| {
            (0..cols)
                .map(|col| {
                    f32::from_bits(a_words[a_offset + r * cols + col])
                        * f32::from_bits(x_words[x_offset + col])
                })
                .sum()
        })
        .collect();

    let out = storage
        .buffers
        .get_mut(&y.id)
        .ok_or_else(|| format!("buffer {} is not allocated", y.id))?;
    check_span("y", out.len(), y_offset + row_offset, rows, 1, rows)?;
    for (i, sum) in sums.into_iter().enumerate() {
        let idx = y_offset + row_offset + i;
        let value = if beta == 0.0 {
            alpha * sum
        } else {
            alpha * sum + beta * f32::from_bits(out[idx])
        };
        out[idx] = value.to_bits();
    }
    Ok(())
}

/// `y[i] += alpha * x[i]` for `i < n`.
fn axpy(storage: &mut Storage, launch: &KernelLaunch) -> KernelResult {
    let mut args = Args::new(launch);
    let n = args.index()?;
    let alpha = args.float()?;
    let x = args.buffer()?;
    let x_offset = args.index()?;
    let y = args.buffer()?;
    let y_offset = args.index()?;
    args.finish()?;
    vector_global(launch)?;

    let xs: Vec<u32> = {
        let words = storage.buffer(x)?;
        check_span("x", words.len(), x_offset, n, 1, n)?;
        words[x_offset..x_offset + n].to_vec()
    };
    let out = storage
        .buffers
        .get_mut(&y.id)
        .ok_or_else(|| format!("buffer {} is not allocated", y.id))?;
    check_span("y", out.len(), y_offset, n, 1, n)?;
    for (dst, src) in out[y_offset..y_offset + n].iter_mut().zip(xs) {
        *dst = (f32::from_bits(*dst) + alpha * f32::from_bits(src)).to_bits();
    }
    Ok(())
}

/// `y[i] = alpha` for `i < n`.
fn fill(kind: ElementKind, storage: &mut Storage, launch: &KernelLaunch) -> KernelResult {
    let mut args = Args::new(launch);
    let n = args.index()?;
    let word = match kind {
        ElementKind::I32 => args.int()? as u32,
        _ => args.float()?.to_bits(),
    };
    let y = args.buffer()?;
    let y_offset = args.index()?;
    args.finish()?;
    if vector_global(launch)? != VECTOR_GLOBAL_SIZE {
        return Err(format!("{}: unexpected global size", launch.kernel.name()));
    }
    let out = storage
        .buffers
        .get_mut(&y.id)
        .ok_or_else(|| format!("buffer {} is not allocated", y.id))?;
    check_span("y", out.len(), y_offset, n, 1, n)?;
    out[y_offset..y_offset + n].fill(word);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageFormat;
    use crate::kernels::KernelId;
    use crate::variant::TileShape;

    fn storage_with(buffers: &[(BufferId, Vec<f32>)]) -> Storage {
        let mut storage = Storage::default();
        for (id, values) in buffers {
            storage
                .buffers
                .insert(*id, values.iter().map(|v| v.to_bits()).collect());
        }
        storage
    }

    fn buf(id: BufferId, len: usize) -> DeviceBuffer {
        DeviceBuffer {
            id,
            len,
            kind: ElementKind::F32,
        }
    }

    fn floats(storage: &Storage, id: BufferId) -> Vec<f32> {
        storage.buffers[&id].iter().map(|w| f32::from_bits(*w)).collect()
    }

    #[test]
    fn padded_copy_zero_fills_margin() {
        let mut storage = storage_with(&[(1, (1..=6).map(|v| v as f32).collect())]);
        let desc = ImageDesc::new(4, 3, ImageFormat::BLOCK_READ);
        let img = DeviceImage { id: 9, desc };
        storage.images.insert(9, HostImage::new(desc));

        let launch = KernelLaunch::new(
            kernels::copy_to_image(false),
            vec![
                KernelArg::Buffer(buf(1, 6)),
                KernelArg::Image(img.clone()),
                KernelArg::Int(0),
                KernelArg::Int(2),
                KernelArg::Int(2),
                KernelArg::Int(3),
            ],
            &[4, 3],
            None,
        );
        execute(HostKernel::CopyNoTranspose, &mut storage, &launch).unwrap();
        let image = &storage.images[&9];
        let row = |y: usize| -> Vec<f32> { (0..4).map(|x| image.read_f32(x, y)).collect() };
        assert_eq!(row(0), vec![1.0, 2.0, 0.0, 0.0]);
        assert_eq!(row(1), vec![4.0, 5.0, 0.0, 0.0]);
        assert_eq!(row(2), vec![0.0; 4]);
    }

    #[test]
    fn gemm_rejects_short_argument_list() {
        let mut storage = Storage::default();
        let key = KernelKey {
            shape: TileShape::Image32x1,
            trans_a: Transpose::NoTrans,
            b_read: BRead::Blocked,
            alpha_one: true,
            beta_zero: true,
        };
        let launch = KernelLaunch::new(
            KernelId::new(kernels::ProgramModule::GemmImage, key.program_name()),
            vec![KernelArg::Int(0)],
            &[8, 1],
            Some(&LOCAL_SIZE[..]),
        );
        let err = execute(HostKernel::Gemm(key), &mut storage, &launch).unwrap_err();
        assert!(err.contains("expected image"), "{err}");
    }

    #[test]
    fn index_arguments_are_non_negative_ints() {
        let launch = KernelLaunch::new(
            KernelId::new(kernels::ProgramModule::GemmImage, "bind_check"),
            vec![KernelArg::Int(7), KernelArg::Int(-1), KernelArg::Float(3.0)],
            &[1],
            None,
        );
        let mut args = Args::new(&launch);
        assert_eq!(args.index(), Ok(7));
        assert!(args.index().unwrap_err().contains("non-negative integer"));
        assert!(args.index().unwrap_err().contains("got Float"));
    }

    #[test]
    fn axpy_and_fill() {
        let mut storage = storage_with(&[(1, vec![1.0, 2.0, 3.0]), (2, vec![10.0; 3])]);
        let launch = KernelLaunch::new(
            kernels::axpy(ElementKind::F32),
            vec![
                KernelArg::Int(3),
                KernelArg::Float(2.0),
                KernelArg::Buffer(buf(1, 3)),
                KernelArg::Int(0),
                KernelArg::Buffer(buf(2, 3)),
                KernelArg::Int(0),
            ],
            &[VECTOR_GLOBAL_SIZE],
            Some(&[VECTOR_LOCAL_SIZE][..]),
        );
        execute(HostKernel::Axpy, &mut storage, &launch).unwrap();
        assert_eq!(floats(&storage, 2), vec![12.0, 14.0, 16.0]);

        let launch = KernelLaunch::new(
            kernels::fill(ElementKind::F32),
            vec![
                KernelArg::Int(2),
                KernelArg::Float(0.5),
                KernelArg::Buffer(buf(2, 3)),
                KernelArg::Int(1),
            ],
            &[VECTOR_GLOBAL_SIZE],
            Some(&[VECTOR_LOCAL_SIZE][..]),
        );
        execute(HostKernel::Fill(ElementKind::F32), &mut storage, &launch).unwrap();
        assert_eq!(floats(&storage, 2), vec![12.0, 0.5, 0.5]);
    }

    #[test]
    fn programs_cover_gemm_table() {
        let programs = builtin_programs();
        assert_eq!(programs.len(), KernelTable::builtin().len() + 7);
        assert_eq!(
            programs.get("gemm_32_2_TN_0_1_float").copied().map(|k| matches!(k, HostKernel::Gemm(_))),
            Some(true)
        );
    }
}
