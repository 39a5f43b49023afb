use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::Path,
};

use nalgebra::{DMatrix, RowDVector};
use serde::{Deserialize, Serialize};
use serde_pickle::{DeOptions, SerOptions};

use crate::{
    error::{Error, Result},
    neural_net::{Activation, Layer, NeuralNetwork},
};

pub const FORMAT_VERSION: u32 = 1;

const SIGNATURE_FILE: &str = "saved_model.ron";
const VARIABLES_DIR: &str = "variables";
const VARIABLES_FILE: &str = "variables.pkl";

/// Shape and element type of a serving tensor; `None` is the batch dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: String,
    pub shape: Vec<Option<usize>>,
    pub dtype: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerDescriptor {
    pub name: String,
    pub inputs: usize,
    pub units: usize,
    pub activation: Activation,
}

/// Structure of an exported model, stored as `saved_model.ron`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSignature {
    pub format_version: u32,
    pub inputs: TensorSpec,
    pub outputs: TensorSpec,
    pub layers: Vec<LayerDescriptor>,
}

impl ModelSignature {
    pub fn of(model: &NeuralNetwork) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            inputs: TensorSpec {
                name: "input_layer".to_string(),
                shape: vec![None, Some(model.input_dim())],
                dtype: "float32".to_string(),
            },
            outputs: TensorSpec {
                name: "output".to_string(),
                shape: vec![None, Some(model.output_dim())],
                dtype: "float32".to_string(),
            },
            layers: model
                .layers()
                .iter()
                .map(|layer| LayerDescriptor {
                    name: layer.name.clone(),
                    inputs: layer.inputs(),
                    units: layer.units(),
                    activation: layer.activation,
                })
                .collect(),
        }
    }
}

/// Parameters of one layer; `weights` is row-major (`inputs` rows of `units`).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LayerVariables {
    name: String,
    weights: Vec<f32>,
    bias: Vec<f32>,
}

/// Writes `model` to `dir`, replacing files left by a previous export.
/// A failure part-way leaves whatever was already written.
pub fn export<P: AsRef<Path>>(model: &NeuralNetwork, dir: P) -> Result<()> {
    let dir = dir.as_ref();
    let variables_dir = dir.join(VARIABLES_DIR);
    fs::create_dir_all(&variables_dir)?;

    let signature = ron::ser::to_string_pretty(&ModelSignature::of(model), ron::ser::PrettyConfig::default())?;
    fs::write(dir.join(SIGNATURE_FILE), signature)?;

    let variables = model
        .layers()
        .iter()
        .map(|layer| LayerVariables {
            name: layer.name.clone(),
            weights: layer.weights.transpose().as_slice().to_vec(),
            bias: layer.bias.as_slice().to_vec(),
        })
        .collect::<Vec<_>>();
    let mut writer = BufWriter::new(File::create(variables_dir.join(VARIABLES_FILE))?);
    serde_pickle::to_writer(&mut writer, &variables, SerOptions::new())?;
    writer.flush()?;

    log::info!("Exported {} parameters to {}", model.num_params(), dir.display());
    Ok(())
}

/// Reads an export back, checking the parameters against the signature.
pub fn load<P: AsRef<Path>>(dir: P) -> Result<NeuralNetwork> {
    let dir = dir.as_ref();
    let signature: ModelSignature = ron::from_str(&fs::read_to_string(dir.join(SIGNATURE_FILE))?)?;
    if signature.format_version != FORMAT_VERSION {
        return Err(Error::format(format!(
            "unsupported export format version {}",
            signature.format_version
        )));
    }

    let reader = BufReader::new(File::open(dir.join(VARIABLES_DIR).join(VARIABLES_FILE))?);
    let variables: Vec<LayerVariables> = serde_pickle::from_reader(reader, DeOptions::new())?;
    if variables.len() != signature.layers.len() {
        return Err(Error::shape(format!(
            "signature lists {} layers but {} were saved",
            signature.layers.len(),
            variables.len()
        )));
    }

    let layers = signature
        .layers
        .iter()
        .zip(variables)
        .map(|(descriptor, variables)| {
            if descriptor.name != variables.name
                || variables.weights.len() != descriptor.inputs * descriptor.units
                || variables.bias.len() != descriptor.units
            {
                return Err(Error::shape(format!(
                    "saved parameters of layer {} do not match its descriptor",
                    descriptor.name
                )));
            }
            Layer::new(
                descriptor.name.clone(),
                DMatrix::from_row_slice(descriptor.inputs, descriptor.units, &variables.weights),
                RowDVector::from_row_slice(&variables.bias),
                descriptor.activation,
            )
        })
        .collect::<Result<Vec<_>>>()?;

    let model = NeuralNetwork::new(layers)?;
    if model.output_dim() != signature.outputs.shape.last().copied().flatten().unwrap_or(0) {
        return Err(Error::shape("output spec does not match the output layer"));
    }
    Ok(model)
}
