use std::fmt::Debug;

/// Writes its `Debug` output on one line, even when the outer value is
/// formatted with `{:#?}`.
pub struct DebugInline<'a, T: Debug>(pub &'a T);

impl<'a, T: Debug> Debug for DebugInline<'a, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let d = format!("{:?}", self.0);
        f.write_str(&d)
    }
}

/// Adds `name` to `debug_struct` only when `value` is `Some(_)`.
pub fn opt_field<'a, 'b: 'a>(debug_struct: &mut std::fmt::DebugStruct<'a, 'b>,
                             name: &str, value: &Option<impl Debug>)
{
    let Some(ref value) = value else {
        return;
    };

    debug_struct.field(name, value);
}
