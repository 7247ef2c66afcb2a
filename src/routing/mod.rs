mod table;

pub use table::{PathPattern, Route, RouteTable};
