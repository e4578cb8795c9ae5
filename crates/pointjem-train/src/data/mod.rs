pub mod loader;
pub mod shapes;
pub mod views;

pub use loader::ViewLoader;
pub use shapes::{PointCloudDataset, ShapeKind, SyntheticShapes};
pub use views::ViewSampler;
