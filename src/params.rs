use burn::tensor::{backend::Backend, Tensor};

use crate::MetaError;

/// Position of one learner tensor inside the flat parameter vector.
#[derive(new, Debug, Clone, PartialEq, Eq)]
pub struct ParamEntry {
    /// Name of the tensor.
    pub name: String,
    /// Shape of the tensor.
    pub shape: Vec<usize>,
    /// Offset of the first element in the flat vector.
    pub offset: usize,
}

impl ParamEntry {
    /// Number of elements covered by the tensor.
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }
}

/// The canonical order in which learner tensors are concatenated into a parameter vector.
///
/// The order is the insertion order and never changes once built, which makes
/// [flatten](ParamLayout::flatten) and [unflatten](ParamLayout::unflatten) mutual inverses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamLayout {
    entries: Vec<ParamEntry>,
    num_params: usize,
}

impl ParamLayout {
    /// Create an empty layout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a tensor to the layout.
    pub fn with(mut self, name: impl Into<String>, shape: impl Into<Vec<usize>>) -> Self {
        let entry = ParamEntry::new(name.into(), shape.into(), self.num_params);
        self.num_params += entry.num_elements();
        self.entries.push(entry);
        self
    }

    /// Total number of scalar parameters.
    pub fn num_params(&self) -> usize {
        self.num_params
    }

    /// The entries, in canonical order.
    pub fn entries(&self) -> &[ParamEntry] {
        &self.entries
    }

    /// Find the entry with the given name.
    pub fn entry(&self, name: &str) -> Result<&ParamEntry, MetaError> {
        self.entries
            .iter()
            .find(|entry| entry.name == name)
            .ok_or_else(|| MetaError::UnknownParam(name.to_string()))
    }

    /// Concatenate flattened tensors, given in layout order, into a single parameter vector.
    ///
    /// Use [flat](flat) to flatten tensors of higher rank.
    pub fn flatten<B: Backend>(&self, tensors: Vec<Tensor<B, 1>>) -> Result<Tensor<B, 1>, MetaError> {
        if tensors.len() != self.entries.len() {
            return Err(MetaError::InvalidConfig(format!(
                "Expected {} tensors to flatten, got {}",
                self.entries.len(),
                tensors.len()
            )));
        }

        for (entry, tensor) in self.entries.iter().zip(tensors.iter()) {
            let [actual] = tensor.dims();
            if actual != entry.num_elements() {
                return Err(MetaError::LengthMismatch {
                    expected: entry.num_elements(),
                    actual,
                });
            }
        }

        if tensors.is_empty() {
            return Err(MetaError::InvalidConfig(
                "Cannot flatten an empty layout".to_string(),
            ));
        }

        Ok(Tensor::cat(tensors, 0))
    }

    /// Split a parameter vector back into named tensors.
    ///
    /// Fails if the vector length differs from [num_params](ParamLayout::num_params).
    pub fn unflatten<B: Backend>(&self, flat: Tensor<B, 1>) -> Result<FlatParams<B>, MetaError> {
        let [actual] = flat.dims();
        if actual != self.num_params {
            return Err(MetaError::LengthMismatch {
                expected: self.num_params,
                actual,
            });
        }

        Ok(FlatParams {
            layout: self.clone(),
            flat,
        })
    }
}

/// Flatten a tensor of any rank into a vector.
pub fn flat<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Tensor<B, 1> {
    let num_elements = tensor.shape().num_elements();
    tensor.reshape([num_elements])
}

/// A parameter vector together with the layout needed to read named tensors out of it.
///
/// Reading a tensor slices the vector, so anything computed from it stays connected to the
/// vector's autodiff graph.
#[derive(Debug, Clone)]
pub struct FlatParams<B: Backend> {
    layout: ParamLayout,
    flat: Tensor<B, 1>,
}

impl<B: Backend> FlatParams<B> {
    /// Read the named tensor with its original shape.
    pub fn get<const D: usize>(&self, name: &str) -> Result<Tensor<B, D>, MetaError> {
        let entry = self.layout.entry(name)?;
        let rank_mismatch = || MetaError::RankMismatch {
            name: name.to_string(),
            expected: D,
            actual: entry.shape.len(),
        };

        if entry.shape.len() != D {
            return Err(rank_mismatch());
        }
        let dims: [usize; D] = entry.shape.clone().try_into().map_err(|_| rank_mismatch())?;

        Ok(self
            .flat
            .clone()
            .narrow(0, entry.offset, entry.num_elements())
            .reshape(dims))
    }

    /// The layout of the vector.
    pub fn layout(&self) -> &ParamLayout {
        &self.layout
    }

    /// The parameter vector.
    pub fn flat(&self) -> &Tensor<B, 1> {
        &self.flat
    }

    /// Consume and return the parameter vector.
    pub fn into_flat(self) -> Tensor<B, 1> {
        self.flat
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestBackend;
    use burn::tensor::TensorData;

    fn layout() -> ParamLayout {
        ParamLayout::new().with("weight", [2, 3]).with("bias", [3])
    }

    #[test]
    fn layout_offsets_follow_insertion_order() {
        let layout = layout();

        assert_eq!(layout.num_params(), 9);
        assert_eq!(layout.entries()[0].offset, 0);
        assert_eq!(layout.entries()[1].offset, 6);
        assert_eq!(layout.entry("bias").unwrap().num_elements(), 3);
    }

    #[test]
    fn unflatten_restores_every_tensor() {
        let device = Default::default();
        let weight = Tensor::<TestBackend, 2>::from_floats([[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]], &device);
        let bias = Tensor::<TestBackend, 1>::from_floats([7.0, 8.0, 9.0], &device);
        let layout = layout();

        let vector = layout
            .flatten(vec![flat(weight.clone()), bias.clone()])
            .unwrap();
        let params = layout.unflatten(vector).unwrap();

        assert_eq!(params.get::<2>("weight").unwrap().into_data(), weight.into_data());
        assert_eq!(params.get::<1>("bias").unwrap().into_data(), bias.into_data());
    }

    #[test]
    fn unflatten_rejects_wrong_length() {
        let device = Default::default();
        let vector = Tensor::<TestBackend, 1>::from_data(TensorData::new(vec![0.0f32; 8], [8]), &device);

        let result = layout().unflatten(vector);

        assert_eq!(
            result.err(),
            Some(MetaError::LengthMismatch {
                expected: 9,
                actual: 8
            })
        );
    }

    #[test]
    fn flatten_rejects_wrong_part_length() {
        let device = Default::default();
        let weight = Tensor::<TestBackend, 1>::zeros([5], &device);
        let bias = Tensor::<TestBackend, 1>::zeros([3], &device);

        let result = layout().flatten(vec![weight, bias]);

        assert!(matches!(result, Err(MetaError::LengthMismatch { expected: 6, actual: 5 })));
    }

    #[test]
    fn get_checks_rank_and_name() {
        let device = Default::default();
        let params = layout()
            .unflatten(Tensor::<TestBackend, 1>::zeros([9], &device))
            .unwrap();

        assert!(matches!(
            params.get::<1>("weight"),
            Err(MetaError::RankMismatch { expected: 1, actual: 2, .. })
        ));
        assert_eq!(
            params.get::<1>("scale").err(),
            Some(MetaError::UnknownParam("scale".to_string()))
        );
    }
}
