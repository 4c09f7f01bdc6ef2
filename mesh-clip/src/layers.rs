use candle_core::{Result, Tensor};
use candle_nn::{Activation, Linear, Module, VarBuilder};

/// build a stack of alternating `Linear` and activation layers
pub struct LayerStack {
    linear_layers: Vec<Linear>,
    activation_layers: Vec<Option<Activation>>,
}

impl Module for LayerStack {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let mut x = input.clone();
        for (linear, activation) in self.linear_layers.iter().zip(self.activation_layers.iter()) {
            x = linear.forward(&x)?;
            if let Some(activation) = activation {
                x = activation.forward(&x)?;
            }
        }
        Ok(x)
    }
}

impl LayerStack {
    pub fn new() -> Self {
        Self {
            linear_layers: Vec::new(),
            activation_layers: Vec::new(),
        }
    }

    /// Stack `in_dim -> layers[0] -> ... -> layers[L-1]` with `activation`
    /// after each layer, naming variables `{prefix}.{j}.weight|bias`.
    pub fn build(
        in_dim: usize,
        layers: &[usize],
        activation: Activation,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut stack = Self::new();
        let mut prev_dim = in_dim;
        for (j, &next_dim) in layers.iter().enumerate() {
            stack.push_with_act(candle_nn::linear(prev_dim, next_dim, vb.pp(j))?, activation);
            prev_dim = next_dim;
        }
        Ok(stack)
    }

    /// Appends a layer after all the current layers.
    pub fn push_with_act(&mut self, layer: Linear, activation: Activation) {
        self.linear_layers.push(layer);
        self.activation_layers.push(Some(activation));
    }

    /// output dimension of the last layer, if any
    pub fn out_dim(&self) -> Option<usize> {
        self.linear_layers.last().map(|l| l.weight().dims()[0])
    }

    pub fn parameters(&self) -> Vec<Tensor> {
        self.linear_layers.iter().flat_map(linear_parameters).collect()
    }
}

impl Default for LayerStack {
    fn default() -> Self {
        Self::new()
    }
}

/// weight and (optional) bias of a linear layer
pub fn linear_parameters(linear: &Linear) -> Vec<Tensor> {
    std::iter::once(linear.weight().clone())
        .chain(linear.bias().cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn stack_shapes_and_parameters() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);

        let stack = LayerStack::build(5, &[8, 3], Activation::Relu, vb.pp("fc"))?;
        assert_eq!(stack.out_dim(), Some(3));
        assert_eq!(stack.parameters().len(), 4);
        assert_eq!(varmap.all_vars().len(), 4);

        let x = Tensor::randn(0f32, 1f32, (7, 5), &dev)?;
        let y = stack.forward(&x)?;
        assert_eq!(y.dims(), &[7, 3]);
        // relu after the last layer as well
        assert!(y.flatten_all()?.to_vec1::<f32>()?.iter().all(|&v| v >= 0.));
        Ok(())
    }
}
