//! IDX binary dataset loading (the MNIST distribution format).
//!
//! ## Format
//!
//! Every file starts with a magic number: two zero bytes, a data-type byte
//! (`0x08` for unsigned bytes) and a dimension-count byte, followed by one
//! big-endian `u32` per dimension, followed by the payload in row-major
//! order:
//! ```text
//! [0x00 0x00 <dtype> <ndim>] [dim_0: u32] ... [dim_{n-1}: u32] [data...]
//! ```
//! Image files have three dimensions (count, rows, cols), label files one.

use ndarray::Array2;
use std::fs;
use std::io;
use std::path::Path;

/// IDX data-type byte for unsigned 8-bit payloads.
const IDX_UNSIGNED_BYTE: u8 = 0x08;

/// Load an IDX image file into a `(num_images, rows * cols)` matrix with
/// pixels scaled to [0, 1].
///
/// # Errors
/// I/O failures, or `InvalidData` if the magic number, dimension count or
/// payload length disagree with the header.
pub fn load_idx_images(path: &Path) -> io::Result<Array2<f64>> {
    let bytes = fs::read(path)?;
    check_magic(&bytes, 3)?;

    let count = read_dim(&bytes, 0)? as usize;
    let rows = read_dim(&bytes, 1)? as usize;
    let cols = read_dim(&bytes, 2)? as usize;
    let pixels = rows * cols;

    let payload = &bytes[4 + 3 * 4..];
    if payload.len() != count * pixels {
        return Err(invalid_data(format!(
            "IDX payload: expected {} bytes for {} images of {}x{}, got {}",
            count * pixels,
            count,
            rows,
            cols,
            payload.len()
        )));
    }

    let scaled: Vec<f64> = payload.iter().map(|&b| f64::from(b) / 255.0).collect();
    Array2::from_shape_vec((count, pixels), scaled)
        .map_err(|e| invalid_data(format!("IDX image reshape failed: {e}")))
}

/// Load an IDX label file into a vector of class labels.
///
/// # Errors
/// I/O failures, or `InvalidData` on a malformed header or truncated
/// payload.
pub fn load_idx_labels(path: &Path) -> io::Result<Vec<u8>> {
    let bytes = fs::read(path)?;
    check_magic(&bytes, 1)?;

    let count = read_dim(&bytes, 0)? as usize;
    let payload = &bytes[4 + 4..];
    if payload.len() != count {
        return Err(invalid_data(format!(
            "IDX payload: expected {} labels, got {}",
            count,
            payload.len()
        )));
    }

    Ok(payload.to_vec())
}

fn check_magic(bytes: &[u8], expected_ndim: u8) -> io::Result<()> {
    let header_len = 4 + usize::from(expected_ndim) * 4;
    if bytes.len() < header_len {
        return Err(invalid_data(format!(
            "IDX header: need at least {} bytes, got {}",
            header_len,
            bytes.len()
        )));
    }
    if bytes[0] != 0 || bytes[1] != 0 {
        return Err(invalid_data("IDX magic: first two bytes must be zero".to_string()));
    }
    if bytes[2] != IDX_UNSIGNED_BYTE {
        return Err(invalid_data(format!(
            "IDX dtype: expected 0x08 (unsigned byte), got {:#04x}",
            bytes[2]
        )));
    }
    if bytes[3] != expected_ndim {
        return Err(invalid_data(format!(
            "IDX dimensions: expected {}, got {}",
            expected_ndim, bytes[3]
        )));
    }
    Ok(())
}

fn read_dim(bytes: &[u8], index: usize) -> io::Result<u32> {
    let offset = 4 + index * 4;
    let raw: [u8; 4] = bytes[offset..offset + 4]
        .try_into()
        .map_err(|_| invalid_data("IDX header truncated".to_string()))?;
    Ok(u32::from_be_bytes(raw))
}

fn invalid_data(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    fn write_temp(name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("eqprop_idx_tests");
        std::fs::create_dir_all(&dir).expect("create temp dir");
        let path = dir.join(name);
        let mut file = File::create(&path).expect("create temp file");
        file.write_all(bytes).expect("write temp file");
        path
    }

    fn image_file(count: u32, rows: u32, cols: u32, payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0, 0, 0x08, 3];
        bytes.extend_from_slice(&count.to_be_bytes());
        bytes.extend_from_slice(&rows.to_be_bytes());
        bytes.extend_from_slice(&cols.to_be_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn test_load_images_round_trip() {
        let payload = [0u8, 255, 128, 64, 32, 16, 8, 4];
        let path = write_temp("images_ok", &image_file(2, 2, 2, &payload));

        let images = load_idx_images(&path).expect("load images");
        assert_eq!(images.dim(), (2, 4));
        assert_eq!(images[[0, 0]], 0.0);
        assert_eq!(images[[0, 1]], 1.0);
        assert!((images[[0, 2]] - 128.0 / 255.0).abs() < 1e-12);
        assert!((images[[1, 3]] - 4.0 / 255.0).abs() < 1e-12);
    }

    #[test]
    fn test_load_labels_round_trip() {
        let mut bytes = vec![0, 0, 0x08, 1];
        bytes.extend_from_slice(&3u32.to_be_bytes());
        bytes.extend_from_slice(&[7, 0, 9]);
        let path = write_temp("labels_ok", &bytes);

        let labels = load_idx_labels(&path).expect("load labels");
        assert_eq!(labels, vec![7, 0, 9]);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = image_file(1, 1, 1, &[5]);
        bytes[0] = 1;
        let path = write_temp("bad_magic", &bytes);
        assert!(load_idx_images(&path).is_err());
    }

    #[test]
    fn test_wrong_dtype_rejected() {
        let mut bytes = image_file(1, 1, 1, &[5]);
        bytes[2] = 0x0D; // float payloads are not supported
        let path = write_temp("bad_dtype", &bytes);
        assert!(load_idx_images(&path).is_err());
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let bytes = image_file(2, 2, 2, &[1, 2, 3]); // needs 8 bytes
        let path = write_temp("truncated", &bytes);
        assert!(load_idx_images(&path).is_err());

        let mut label_bytes = vec![0, 0, 0x08, 1];
        label_bytes.extend_from_slice(&5u32.to_be_bytes());
        label_bytes.extend_from_slice(&[1, 2]);
        let path = write_temp("truncated_labels", &label_bytes);
        assert!(load_idx_labels(&path).is_err());
    }

    #[test]
    fn test_dimension_count_mismatch() {
        // a label-shaped header passed to the image loader
        let mut bytes = vec![0, 0, 0x08, 1];
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.push(3);
        let path = write_temp("wrong_ndim", &bytes);
        assert!(load_idx_images(&path).is_err());
    }
}
