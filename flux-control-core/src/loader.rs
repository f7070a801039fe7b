use anyhow::Result;

use crate::{DeviceMap, ModelLike, WeightPaths};

pub trait Loader {
    type Model: ModelLike;

    fn load(paths: &WeightPaths, device_map: DeviceMap) -> Result<Self::Model>
    where
        Self: Sized;
}
