//! Analyze 7.5 hdr/img pairs, little-endian, plus the sparse variant that
//! stores only non-zero voxels as `(index, value)` records. A sparse image
//! is recognised on read by its .img file being shorter than the dense
//! voxel block the header promises.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::errors::QmriError;
use crate::image::Image3D;

use super::DataType;

const HEADER_SIZE: usize = 348;

const DT_SIGNED_SHORT: i16 = 4;
const DT_FLOAT: i16 = 16;
const DT_DOUBLE: i16 = 64;

impl DataType {
    fn code(self) -> i16 {
        match self {
            DataType::Short => DT_SIGNED_SHORT,
            DataType::Float => DT_FLOAT,
            DataType::Double => DT_DOUBLE,
        }
    }

    fn bitpix(self) -> i16 {
        match self {
            DataType::Short => 16,
            DataType::Float => 32,
            DataType::Double => 64,
        }
    }

    fn from_code(code: i16) -> Result<Self, QmriError> {
        match code {
            DT_SIGNED_SHORT => Ok(DataType::Short),
            DT_FLOAT => Ok(DataType::Float),
            DT_DOUBLE => Ok(DataType::Double),
            _ => Err(QmriError::format(format!(
                "unsupported Analyze datatype code {code}"
            ))),
        }
    }
}

pub fn write(
    base: &Path,
    img: &Image3D,
    dtype: DataType,
    sparse: bool,
) -> Result<(), QmriError> {
    write_header(&base.with_extension("hdr"), img, dtype)?;

    let img_path = base.with_extension("img");
    let file = File::create(&img_path).map_err(|e| QmriError::io(&img_path, e))?;
    let mut w = BufWriter::new(file);

    let voxels = img.as_slice();
    let result: std::io::Result<()> = if sparse {
        img.nonzero_voxels().into_iter().try_for_each(|(idx, v)| {
            w.write_u32::<LittleEndian>(idx as u32)?;
            write_value(&mut w, v, dtype)
        })
    } else {
        voxels.iter().try_for_each(|&v| write_value(&mut w, v, dtype))
    };
    result.map_err(|e| QmriError::io(&img_path, e))?;
    w.flush().map_err(|e| QmriError::io(&img_path, e))?;
    Ok(())
}

pub fn read(base: &Path) -> Result<Image3D, QmriError> {
    let hdr_path = base.with_extension("hdr");
    let (nx, ny, nz, voxel_mm, dtype) = read_header(&hdr_path)?;

    let mut img = Image3D::new(nx, ny, nz);
    img.set_voxel_mm(voxel_mm.0 as f64, voxel_mm.1 as f64, voxel_mm.2 as f64);

    let img_path = base.with_extension("img");
    let file = File::open(&img_path).map_err(|e| QmriError::io(&img_path, e))?;
    let file_len = file
        .metadata()
        .map_err(|e| QmriError::io(&img_path, e))?
        .len() as usize;
    let mut r = BufReader::new(file);

    let n_voxels = nx * ny * nz;
    let value_size = dtype.bitpix() as usize / 8;
    let dense_len = n_voxels * value_size;

    if file_len == dense_len {
        let slice = img.as_mut_slice();
        for v in slice.iter_mut() {
            *v = read_value(&mut r, dtype).map_err(|e| QmriError::io(&img_path, e))?;
        }
    } else {
        // shorter file: sparse records of (index, value)
        let record = 4 + value_size;
        if file_len % record != 0 {
            return Err(QmriError::format(format!(
                "{}: size {file_len} is neither dense nor sparse records",
                img_path.display()
            )));
        }
        for _ in 0..(file_len / record) {
            let idx = r
                .read_u32::<LittleEndian>()
                .map_err(|e| QmriError::io(&img_path, e))? as usize;
            let value = read_value(&mut r, dtype).map_err(|e| QmriError::io(&img_path, e))?;
            if idx >= n_voxels {
                return Err(QmriError::format(format!(
                    "{}: sparse voxel index {idx} outside volume",
                    img_path.display()
                )));
            }
            img.set_voxel(idx, value);
        }
    }
    Ok(img)
}

fn write_value<W: Write>(w: &mut W, v: f64, dtype: DataType) -> std::io::Result<()> {
    match dtype {
        DataType::Short => w.write_i16::<LittleEndian>(v.round() as i16),
        DataType::Float => w.write_f32::<LittleEndian>(v as f32),
        DataType::Double => w.write_f64::<LittleEndian>(v),
    }
}

fn read_value<R: Read>(r: &mut R, dtype: DataType) -> std::io::Result<f64> {
    Ok(match dtype {
        DataType::Short => r.read_i16::<LittleEndian>()? as f64,
        DataType::Float => r.read_f32::<LittleEndian>()? as f64,
        DataType::Double => r.read_f64::<LittleEndian>()?,
    })
}

fn write_header(path: &Path, img: &Image3D, dtype: DataType) -> Result<(), QmriError> {
    let file = File::create(path).map_err(|e| QmriError::io(path, e))?;
    let mut w = BufWriter::new(file);
    let (nx, ny, nz) = img.dims();
    let (dx, dy, dz) = img.voxel_mm();

    let inner = |w: &mut BufWriter<File>| -> std::io::Result<()> {
        // header_key
        w.write_i32::<LittleEndian>(HEADER_SIZE as i32)?;
        w.write_all(&[0u8; 10])?; // data_type
        w.write_all(&[0u8; 18])?; // db_name
        w.write_i32::<LittleEndian>(16384)?; // extents
        w.write_i16::<LittleEndian>(0)?; // session_error
        w.write_u8(b'r')?; // regular
        w.write_u8(0)?; // hkey_un0

        // image_dimension
        let dim: [i16; 8] = [4, nx as i16, ny as i16, nz as i16, 1, 0, 0, 0];
        for d in dim {
            w.write_i16::<LittleEndian>(d)?;
        }
        for _ in 0..7 {
            w.write_i16::<LittleEndian>(0)?; // unused8..unused14
        }
        w.write_i16::<LittleEndian>(dtype.code())?;
        w.write_i16::<LittleEndian>(dtype.bitpix())?;
        w.write_i16::<LittleEndian>(0)?; // dim_un0
        let pixdim: [f32; 8] = [0.0, dx as f32, dy as f32, dz as f32, 0.0, 0.0, 0.0, 0.0];
        for p in pixdim {
            w.write_f32::<LittleEndian>(p)?;
        }
        w.write_f32::<LittleEndian>(0.0)?; // vox_offset
        for _ in 0..3 {
            w.write_f32::<LittleEndian>(0.0)?; // funused1..3
        }
        w.write_f32::<LittleEndian>(0.0)?; // cal_max
        w.write_f32::<LittleEndian>(0.0)?; // cal_min
        w.write_f32::<LittleEndian>(0.0)?; // compressed
        w.write_f32::<LittleEndian>(0.0)?; // verified
        w.write_i32::<LittleEndian>(0)?; // glmax
        w.write_i32::<LittleEndian>(0)?; // glmin

        // data_history, all zero
        w.write_all(&[0u8; 200])?;
        w.flush()
    };
    inner(&mut w).map_err(|e| QmriError::io(path, e))
}

#[allow(clippy::type_complexity)]
fn read_header(path: &Path) -> Result<(usize, usize, usize, (f32, f32, f32), DataType), QmriError> {
    let file = File::open(path).map_err(|e| QmriError::io(path, e))?;
    let mut r = BufReader::new(file);
    let mut buf = [0u8; HEADER_SIZE];
    r.read_exact(&mut buf).map_err(|e| QmriError::io(path, e))?;

    let i32_at = |o: usize| i32::from_le_bytes(buf[o..o + 4].try_into().unwrap());
    let i16_at = |o: usize| i16::from_le_bytes(buf[o..o + 2].try_into().unwrap());
    let f32_at = |o: usize| f32::from_le_bytes(buf[o..o + 4].try_into().unwrap());

    if i32_at(0) != HEADER_SIZE as i32 {
        return Err(QmriError::format(format!(
            "{}: not a little-endian Analyze header",
            path.display()
        )));
    }

    // image_dimension starts at byte 40
    let nx = i16_at(42) as usize;
    let ny = i16_at(44) as usize;
    let nz = i16_at(46) as usize;
    if nx == 0 || ny == 0 || nz == 0 {
        return Err(QmriError::format(format!(
            "{}: degenerate dimensions {nx}x{ny}x{nz}",
            path.display()
        )));
    }
    let datatype = i16_at(70);
    let dx = f32_at(80);
    let dy = f32_at(84);
    let dz = f32_at(88);

    Ok((nx, ny, nz, (dx, dy, dz), DataType::from_code(datatype)?))
}
