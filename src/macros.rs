//! Useful macros.

/// Join the given path components with `/`, skipping empty components and avoiding doubled
/// separators. Evaluates to a `String`.
///
/// ```rust,ignore
/// assert_eq!(dir!("/tmp/perfiso", "10.0.1.1", "cpu.txt"), "/tmp/perfiso/10.0.1.1/cpu.txt");
/// ```
#[macro_export]
macro_rules! dir {
    ($first:expr $(, $part:expr)* $(,)?) => {{
        // A single component never pushes.
        #[allow(unused_mut)]
        let mut path = match $first {
            ref first => {
                let first: &str = first.as_ref();
                String::from(first)
            }
        };
        $(
            match $part {
                ref part => {
                    let part: &str = part.as_ref();
                    if !part.is_empty() {
                        if !path.is_empty() && !path.ends_with('/') {
                            path.push('/');
                        }
                        path.push_str(part.trim_start_matches('/'));
                    }
                }
            }
        )*
        path
    }};
}
