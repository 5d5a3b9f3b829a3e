//! Lossless JSON encoding for floating point arrays.
//!
//! Arrays are sent as a tagged object instead of a JSON number list:
//!
//! ```json
//! {"_elementType": "float64", "_shape": [2, 2], "_data": "<base64>"}
//! ```
//!
//! `_data` holds the little-endian bytes of every element in row-major
//! order, so NaN payloads, infinities and signed zeros survive the trip
//! exactly. The Python adapter decodes the same object into a numpy array.

use crate::config::BridgeConfig;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::de::Error as _;
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

mod sealed {
    pub trait Sealed {}
    impl Sealed for f32 {}
    impl Sealed for f64 {}
}

/// Floating point element types that can be carried in an array payload.
pub trait Element: sealed::Sealed + Copy + 'static {
    /// Value of `_elementType` for this type.
    const TAG: &'static str;
    /// Encoded width in bytes.
    const WIDTH: usize;

    fn write_le(self, out: &mut Vec<u8>);
    fn read_le(bytes: &[u8]) -> Self;
    /// Raw IEEE-754 bits, widened to 64 bits.
    fn to_bits_u64(self) -> u64;
}

impl Element for f32 {
    const TAG: &'static str = "float32";
    const WIDTH: usize = 4;

    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn read_le(bytes: &[u8]) -> Self {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(bytes);
        f32::from_le_bytes(raw)
    }

    fn to_bits_u64(self) -> u64 {
        u64::from(self.to_bits())
    }
}

impl Element for f64 {
    const TAG: &'static str = "float64";
    const WIDTH: usize = 8;

    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn read_le(bytes: &[u8]) -> Self {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        f64::from_le_bytes(raw)
    }

    fn to_bits_u64(self) -> u64 {
        self.to_bits()
    }
}

/// One-dimensional array of `T`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Array1D<T>(pub Vec<T>);

/// Two-dimensional, rectangular, row-major array of `T`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Array2D<T>(pub Vec<Vec<T>>);

pub type Float64Array = Array1D<f64>;
pub type Float32Array = Array1D<f32>;
pub type Float64Array2D = Array2D<f64>;
pub type Float32Array2D = Array2D<f32>;

#[derive(Serialize)]
struct WireOut<'a> {
    #[serde(rename = "_elementType")]
    element_type: &'static str,
    #[serde(rename = "_shape")]
    shape: &'a [usize],
    #[serde(rename = "_data")]
    data: String,
}

#[derive(Deserialize)]
struct WireIn {
    #[serde(rename = "_elementType")]
    element_type: String,
    #[serde(rename = "_shape", default)]
    shape: Option<Vec<usize>>,
    #[serde(rename = "_data")]
    data: String,
}

fn encode_values<'a, T: Element>(values: impl Iterator<Item = &'a T>, count: usize) -> String {
    let mut bytes = Vec::with_capacity(count * T::WIDTH);
    for value in values {
        value.write_le(&mut bytes);
    }
    STANDARD.encode(bytes)
}

fn decode_values<T: Element>(wire: &WireIn) -> Result<Vec<T>, String> {
    if wire.element_type != T::TAG {
        return Err(format!(
            "unexpected element type: {}, expected {}",
            wire.element_type,
            T::TAG
        ));
    }
    let bytes = STANDARD
        .decode(wire.data.as_bytes())
        .map_err(|e| format!("invalid base64 array data: {}", e))?;
    if bytes.len() % T::WIDTH != 0 {
        return Err(format!(
            "array data length {} is not a multiple of {}",
            bytes.len(),
            T::WIDTH
        ));
    }
    Ok(bytes.chunks_exact(T::WIDTH).map(T::read_le).collect())
}

impl<T: Element> Array1D<T> {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Compare element bit patterns, treating equal NaN payloads as equal.
    pub fn bit_eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(&other.0)
                .all(|(a, b)| a.to_bits_u64() == b.to_bits_u64())
    }
}

impl<T: Element> Array2D<T> {
    /// `(rows, columns)`, taking the column count from the first row.
    pub fn shape(&self) -> (usize, usize) {
        let rows = self.0.len();
        let cols = self.0.first().map_or(0, Vec::len);
        (rows, cols)
    }

    /// Compare shape and element bit patterns.
    pub fn bit_eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self.0.iter().zip(&other.0).all(|(a, b)| {
                a.len() == b.len()
                    && a.iter()
                        .zip(b)
                        .all(|(x, y)| x.to_bits_u64() == y.to_bits_u64())
            })
    }
}

impl<T> From<Vec<T>> for Array1D<T> {
    fn from(values: Vec<T>) -> Self {
        Array1D(values)
    }
}

impl<T> From<Vec<Vec<T>>> for Array2D<T> {
    fn from(rows: Vec<Vec<T>>) -> Self {
        Array2D(rows)
    }
}

impl<T> std::ops::Deref for Array1D<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.0
    }
}

impl<T: Element> Serialize for Array1D<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WireOut {
            element_type: T::TAG,
            shape: &[self.0.len()],
            data: encode_values(self.0.iter(), self.0.len()),
        }
        .serialize(serializer)
    }
}

impl<'de, T: Element> Deserialize<'de> for Array1D<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireIn::deserialize(deserializer)?;
        let values = decode_values::<T>(&wire).map_err(D::Error::custom)?;
        match wire.shape.as_deref() {
            None => {}
            Some([len]) if *len == values.len() => {}
            Some(shape) => {
                return Err(D::Error::custom(format!(
                    "shape {:?} does not describe a 1-D array of {} elements",
                    shape,
                    values.len()
                )))
            }
        }
        Ok(Array1D(values))
    }
}

impl<T: Element> Serialize for Array2D<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let (rows, cols) = self.shape();
        if let Some(row) = self.0.iter().position(|r| r.len() != cols) {
            return Err(S::Error::custom(format!(
                "ragged 2-D array: row {} has {} elements, expected {}",
                row,
                self.0[row].len(),
                cols
            )));
        }
        WireOut {
            element_type: T::TAG,
            shape: &[rows, cols],
            data: encode_values(self.0.iter().flatten(), rows * cols),
        }
        .serialize(serializer)
    }
}

impl<'de, T: Element> Deserialize<'de> for Array2D<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireIn::deserialize(deserializer)?;
        let values = decode_values::<T>(&wire).map_err(D::Error::custom)?;
        let (rows, cols) = match wire.shape.as_deref() {
            Some([rows, cols]) => (*rows, *cols),
            other => {
                return Err(D::Error::custom(format!(
                    "2-D array needs a [rows, columns] shape, got {:?}",
                    other
                )))
            }
        };
        if rows.checked_mul(cols) != Some(values.len()) {
            return Err(D::Error::custom(format!(
                "shape [{}, {}] does not match {} elements",
                rows,
                cols,
                values.len()
            )));
        }
        if cols == 0 {
            // No data bounds `rows` here; cap the decoded size at one frame.
            let max_rows = BridgeConfig::MAX_FRAME_LEN / std::mem::size_of::<Vec<T>>();
            if rows > max_rows {
                return Err(D::Error::custom(format!(
                    "shape [{}, 0] exceeds the maximum of {} empty rows",
                    rows, max_rows
                )));
            }
            let mut empty_rows = Vec::new();
            empty_rows.try_reserve_exact(rows).map_err(|e| {
                D::Error::custom(format!("cannot allocate {} empty rows: {}", rows, e))
            })?;
            empty_rows.resize_with(rows, Vec::new);
            return Ok(Array2D(empty_rows));
        }
        Ok(Array2D(
            values.chunks_exact(cols).map(<[T]>::to_vec).collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_1d_roundtrip_preserves_bits() {
        let original = Float64Array::from(vec![1.2, 3.2, 99.1, -14.1]);
        let encoded = serde_json::to_string(&original).unwrap();
        let decoded: Float64Array = serde_json::from_str(&encoded).unwrap();

        assert!(decoded.bit_eq(&original));
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_2d_roundtrip_preserves_shape() {
        let original = Float64Array2D::from(vec![vec![1.2, 3.2], vec![99.1, -14.1]]);
        let encoded = serde_json::to_value(&original).unwrap();
        assert_eq!(encoded["_shape"], json!([2, 2]));

        let decoded: Float64Array2D = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded.shape(), (2, 2));
        assert!(decoded.bit_eq(&original));
    }

    #[test]
    fn test_special_values_survive() {
        let quiet_nan = f64::from_bits(0x7ff8_0000_0000_0001);
        let original = Float64Array::from(vec![
            quiet_nan,
            f64::INFINITY,
            f64::NEG_INFINITY,
            -0.0,
            f64::MIN_POSITIVE / 2.0,
        ]);
        let decoded: Float64Array =
            serde_json::from_str(&serde_json::to_string(&original).unwrap()).unwrap();
        assert!(decoded.bit_eq(&original));
        assert_eq!(decoded[0].to_bits(), 0x7ff8_0000_0000_0001);
        assert!(decoded[3].is_sign_negative());
    }

    #[test]
    fn test_float32_encoding_layout() {
        let original = Float32Array2D::from(vec![vec![1.0f32, -2.5], vec![0.0, f32::NAN]]);
        let value = serde_json::to_value(&original).unwrap();
        assert_eq!(value["_elementType"], "float32");

        let raw = STANDARD.decode(value["_data"].as_str().unwrap()).unwrap();
        assert_eq!(raw.len(), 4 * 4);
        assert_eq!(&raw[..4], &1.0f32.to_le_bytes());
        assert_eq!(&raw[4..8], &(-2.5f32).to_le_bytes());

        let decoded: Float32Array2D = serde_json::from_value(value).unwrap();
        assert!(decoded.bit_eq(&original));
    }

    #[test]
    fn test_element_type_mismatch_rejected() {
        let encoded = serde_json::to_value(Float32Array::from(vec![1.0, 2.0])).unwrap();
        let err = serde_json::from_value::<Float64Array>(encoded).unwrap_err();
        assert!(err.to_string().contains("unexpected element type: float32"));
    }

    #[test]
    fn test_1d_without_shape_accepted() {
        let data = STANDARD.encode([1.5f64.to_le_bytes(), 2.5f64.to_le_bytes()].concat());
        let decoded: Float64Array =
            serde_json::from_value(json!({"_elementType": "float64", "_data": data})).unwrap();
        assert_eq!(decoded.0, vec![1.5, 2.5]);
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let mut value = serde_json::to_value(Float64Array::from(vec![1.0, 2.0, 3.0])).unwrap();
        value["_shape"] = json!([4]);
        assert!(serde_json::from_value::<Float64Array>(value.clone()).is_err());

        value["_shape"] = json!([2, 2]);
        assert!(serde_json::from_value::<Float64Array2D>(value).is_err());
    }

    #[test]
    fn test_2d_requires_two_dimensions() {
        let value = serde_json::to_value(Float64Array::from(vec![1.0, 2.0])).unwrap();
        assert!(serde_json::from_value::<Float64Array2D>(value).is_err());
    }

    #[test]
    fn test_bad_byte_length_rejected() {
        let data = STANDARD.encode([0u8; 7]);
        let err = serde_json::from_value::<Float64Array>(
            json!({"_elementType": "float64", "_data": data}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("not a multiple of 8"));
    }

    #[test]
    fn test_ragged_2d_rejected() {
        let ragged = Float64Array2D::from(vec![vec![1.0, 2.0], vec![3.0]]);
        assert!(serde_json::to_string(&ragged).is_err());
    }

    #[test]
    fn test_empty_arrays() {
        let empty_1d: Float64Array =
            serde_json::from_str(&serde_json::to_string(&Float64Array::default()).unwrap())
                .unwrap();
        assert!(empty_1d.is_empty());

        let rows_without_columns = Float64Array2D::from(vec![Vec::new(), Vec::new()]);
        let decoded: Float64Array2D =
            serde_json::from_str(&serde_json::to_string(&rows_without_columns).unwrap())
                .unwrap();
        assert_eq!(decoded.shape(), (2, 0));
    }

    #[test]
    fn test_huge_empty_row_count_is_rejected() {
        for rows in [usize::MAX, BridgeConfig::MAX_FRAME_LEN] {
            let result = serde_json::from_value::<Float64Array2D>(json!({
                "_elementType": "float64",
                "_shape": [rows, 0],
                "_data": "",
            }));
            let err = result.unwrap_err();
            assert!(err.to_string().contains("empty rows"), "{}", err);
        }
    }

    #[test]
    fn test_arrays_as_struct_fields() {
        #[derive(Serialize, Deserialize)]
        struct Wrapper {
            #[serde(rename = "arr1D")]
            arr_1d: Float64Array,
            #[serde(rename = "arr2D")]
            arr_2d: Float64Array2D,
        }

        let wrapper = Wrapper {
            arr_1d: vec![1.0, 2.0].into(),
            arr_2d: vec![vec![2.5, 1.34], vec![1.1, 99.9]].into(),
        };
        let text = serde_json::to_string(&wrapper).unwrap();
        let back: Wrapper = serde_json::from_str(&text).unwrap();
        assert!(back.arr_1d.bit_eq(&wrapper.arr_1d));
        assert!(back.arr_2d.bit_eq(&wrapper.arr_2d));
    }
}
