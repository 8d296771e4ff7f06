use crate::{initializers::Init, WeightPrecision};
use ndarray::{Array, ArrayD, Dimension, ShapeError, StrideShape};
use ndarray_npy::{NpzReader, ReadNpzError};
use rand::{rngs::StdRng, SeedableRng};
use serde_json::{self, Map, Value};
use std::collections::HashMap;
use std::io::{Cursor, Read, Seek};
use std::{fs, path::Path};
use thiserror::Error;

pub type WeightResult<T> = Result<T, WeightError>;

#[derive(Error, Debug)]
pub enum WeightError {
    #[error("No weights with name {0} found")]
    WeightKeyError(String),
    #[error("Weight file is not a JSON object mapping names to (nested) arrays of numbers")]
    WeightFormatError,
    #[error("Weight file not found. Filesystem reported error\n {0}.")]
    WeightFileNotFoundError(#[from] std::io::Error),
    #[error("Weight file not readable. Filesystem reported error\n {0}.")]
    WeightFileNpzError(#[from] ReadNpzError),
    #[error("Wrong shape for weight:\n {0}.")]
    WeightShapeError(#[from] ShapeError),
}

/// Source of model parameters.
///
/// Parameters are requested by their PyTorch `state_dict` name together with the
/// shape the layer expects. Loaders backed by a file ignore `init`; loaders that
/// create fresh parameters use it to decide how to fill them.
pub trait WeightLoader {
    fn get_weight<D, Sh>(
        &mut self,
        param_name: &str,
        shape: Sh,
        init: Init,
    ) -> WeightResult<Array<WeightPrecision, D>>
    where
        D: Dimension,
        Sh: Into<StrideShape<D>>;
}

/// Reads weights from a JSON object mapping parameter names to arrays, as written by
/// `json.dump({k: v.tolist() for k, v in model.state_dict().items()}, f)`.
/// Arrays may be nested or already flattened; only the number of values has
/// to match the requested shape.
pub struct JsonWeightLoader {
    content: Map<String, Value>,
}

impl JsonWeightLoader {
    pub fn new<P: AsRef<Path>>(path: P) -> WeightResult<JsonWeightLoader> {
        let raw_file = fs::read_to_string(path)?;
        JsonWeightLoader::from_json_str(&raw_file)
    }

    pub fn from_json_str(raw: &str) -> WeightResult<JsonWeightLoader> {
        match serde_json::from_str(raw) {
            Ok(Value::Object(content)) => Ok(JsonWeightLoader { content }),
            _ => Err(WeightError::WeightFormatError),
        }
    }
}

/// Appends all numbers of a (possibly nested) JSON array in row major order.
/// A bare number counts as a scalar parameter.
fn flatten_json(value: &Value, out: &mut Vec<WeightPrecision>) -> WeightResult<()> {
    match value {
        Value::Array(items) => items.iter().try_for_each(|item| flatten_json(item, out)),
        Value::Number(n) => {
            let v = n.as_f64().ok_or(WeightError::WeightFormatError)?;
            out.push(v as WeightPrecision);
            Ok(())
        }
        _ => Err(WeightError::WeightFormatError),
    }
}

impl WeightLoader for JsonWeightLoader {
    fn get_weight<D, Sh>(
        &mut self,
        param_name: &str,
        shape: Sh,
        _init: Init,
    ) -> WeightResult<Array<WeightPrecision, D>>
    where
        D: Dimension,
        Sh: Into<StrideShape<D>>,
    {
        let value = self
            .content
            .get(param_name)
            .ok_or_else(|| WeightError::WeightKeyError(param_name.to_string()))?;
        let mut values = Vec::new();
        flatten_json(value, &mut values)?;
        Ok(Array::from_shape_vec(shape, values)?)
    }
}

/// Reads weights from a numpy `.npz` archive, as written by
/// `np.savez(path, **{k: v.numpy() for k, v in model.state_dict().items()})`.
pub struct NpzWeightLoader<R>
where
    R: Seek + Read,
{
    handle: R,
    /// Maps parameter names (without the `.npy` suffix) to archive entries.
    names: HashMap<String, String>,
}

impl NpzWeightLoader<std::fs::File> {
    pub fn from_path<P: AsRef<Path>>(path: P) -> WeightResult<NpzWeightLoader<std::fs::File>> {
        let handle = std::fs::File::open(path)?;
        NpzWeightLoader::new(handle)
    }
}

impl<'a> NpzWeightLoader<Cursor<&'a [u8]>> {
    pub fn from_buffer(bytes_array: &'a [u8]) -> WeightResult<NpzWeightLoader<Cursor<&'a [u8]>>> {
        NpzWeightLoader::new(Cursor::new(bytes_array))
    }
}

impl<R> NpzWeightLoader<R>
where
    R: Seek + Read,
{
    pub fn new(mut handle: R) -> WeightResult<NpzWeightLoader<R>> {
        let names = NpzReader::new(&mut handle)?
            .names()?
            .into_iter()
            .map(|entry| {
                let key = entry.strip_suffix(".npy").unwrap_or(entry.as_str()).to_string();
                (key, entry)
            })
            .collect();
        Ok(NpzWeightLoader { handle, names })
    }

    /// Number of arrays in the archive.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl<R> WeightLoader for NpzWeightLoader<R>
where
    R: Seek + Read,
{
    /// Arrays are reshaped into the requested shape, so a `(1, 1, C)` token
    /// stored by PyTorch can be requested as a vector of length `C`.
    fn get_weight<D, Sh>(
        &mut self,
        param_name: &str,
        shape: Sh,
        _init: Init,
    ) -> WeightResult<Array<WeightPrecision, D>>
    where
        D: Dimension,
        Sh: Into<StrideShape<D>>,
    {
        let entry = self
            .names
            .get(param_name)
            .ok_or_else(|| WeightError::WeightKeyError(param_name.to_string()))?;

        // The reader in the npy package has to be mut, so we recreate it per lookup.
        let mut reader = NpzReader::new(&mut self.handle)?;
        let arr: ArrayD<WeightPrecision> = reader.by_name(entry)?;

        // into_raw_vec only follows logical order for standard layout arrays
        let values = arr.as_standard_layout().into_owned().into_raw_vec();
        Ok(Array::from_shape_vec(shape, values)?)
    }
}

/// Creates fresh parameters instead of reading them, following [`Init`].
pub struct RandomWeightLoader {
    rng: StdRng,
}

impl RandomWeightLoader {
    pub fn new(seed: u64) -> RandomWeightLoader {
        RandomWeightLoader {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl WeightLoader for RandomWeightLoader {
    fn get_weight<D, Sh>(
        &mut self,
        _param_name: &str,
        shape: Sh,
        init: Init,
    ) -> WeightResult<Array<WeightPrecision, D>>
    where
        D: Dimension,
        Sh: Into<StrideShape<D>>,
    {
        let shape: StrideShape<D> = shape.into();
        let values = init.sample(shape.raw_dim().slice(), &mut self.rng);
        Ok(Array::from_shape_vec(shape, values)?)
    }
}
