//! Log targets built from the enclosing function's path.
//!
//! Use with `#[named]` on the function, e.g.
//! `const METHOD_PATH: &str = method_path!("Client");`

#[macro_export]
macro_rules! function_path {
    () => (concat!(
        module_path!(), "::", function_name!()
    ))
}

#[macro_export]
macro_rules! method_path {
    ($struct_name: literal) => (concat!(
        module_path!(), "::",
        $struct_name, "::",
        function_name!()
    ))
}
