//! Mock construction helpers

use dagserve::accelerator::mock::{MockAcceleratorManager, MockKernel, MockModelConfig};
use dagserve::pipeline::nodes::custom::NodeParams;
use dagserve::pipeline::{CustomNodeLibrary, CustomNodeTensor, NodeLibraryRegistry};
use dagserve::types::{Precision, Tensor, TensorInfo, TensorInfoMap, TensorMap};
use std::sync::Arc;

/// Create a mock manager with a `dummy` model of `size` elements
pub fn create_test_manager(size: usize, nireq: usize) -> Arc<MockAcceleratorManager> {
    let manager = Arc::new(MockAcceleratorManager::new().expect("mock runtime"));
    manager.load(MockModelConfig::dummy("dummy", size).with_nireq(nireq));
    manager
}

/// Dummy model whose kernel always fails
pub fn failing_dummy(name: &str, size: usize) -> MockModelConfig {
    MockModelConfig::dummy(name, size)
        .with_kernel(MockKernel::custom(|_| Err("kernel fault".to_string())))
}

/// Library multiplying every f32 of input `x` by the `factor` param,
/// producing output `y` of the same shape
pub struct ScaleLibrary;

impl ScaleLibrary {
    fn factor(params: &NodeParams) -> Result<f32, i32> {
        params
            .get("factor")
            .map_or(Ok(1.0), |f| f.parse().map_err(|_| -2))
    }
}

impl CustomNodeLibrary for ScaleLibrary {
    fn execute(&self, inputs: &TensorMap, params: &NodeParams) -> Result<Vec<CustomNodeTensor>, i32> {
        let factor = Self::factor(params)?;
        let input = inputs.get("x").ok_or(-1)?;
        let values = input.to_f32_vec().ok_or(-1)?;
        let scaled: Vec<f32> = values.iter().map(|v| v * factor).collect();
        let tensor = Tensor::from_f32(input.shape().to_vec(), &scaled).map_err(|_| -1)?;
        Ok(vec![CustomNodeTensor {
            name: "y".to_string(),
            precision: Precision::FP32,
            dims: input.shape().to_vec(),
            data: tensor.as_bytes().to_vec(),
        }])
    }

    fn inputs_info(&self, _params: &NodeParams) -> Result<TensorInfoMap, i32> {
        Ok([("x".to_string(), TensorInfo::new("x", Precision::FP32, &[1, 10]))].into())
    }

    fn outputs_info(&self, _params: &NodeParams) -> Result<TensorInfoMap, i32> {
        Ok([("y".to_string(), TensorInfo::new("y", Precision::FP32, &[1, 10]))].into())
    }
}

/// Registry holding [`ScaleLibrary`] as `scale`
pub fn create_test_libraries() -> NodeLibraryRegistry {
    let mut libraries = NodeLibraryRegistry::new();
    libraries.register("scale", Arc::new(ScaleLibrary));
    libraries
}
