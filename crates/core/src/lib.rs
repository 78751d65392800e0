pub mod bundle;
pub mod descriptor;
pub mod error;
pub mod ids;
pub mod reference;
pub mod resource;
pub mod url;

pub use bundle::*;
pub use descriptor::{ResourceTypeDescriptor, SearchParamDef, SearchParamKind, TypeRegistry};
pub use error::CoreError;
pub use ids::*;
pub use reference::{ReferenceClassifier, ReferenceKind, ResourceReference};
pub use resource::Resource;
pub use url::{QueryParams, RequestUrl};
