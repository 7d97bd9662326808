use std::default::Default;
use std::str::FromStr;

/// Per-method compiler directives.
///
/// The format is
/// ```text
/// <directive>  ::= <method-substring> ":" <compiler-name>
/// <directives> ::= <directive> "," <directives> | <directive> | ""
/// ```
/// A method whose full name contains `<method-substring>` is compiled by the
/// compiler named `<compiler-name>`, overriding the normal selection policy.
/// No checking is done to ensure that a named compiler exists.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompileDirectives {
    pub directives: Vec<(String, String)>,
}

impl CompileDirectives {
    fn parse_directives(s: &str) -> Result<Vec<(String, String)>, String> {
        s.split(',')
            .filter(|d| !d.is_empty())
            .map(|d| match d.split_once(':') {
                Some((key, value)) if !key.is_empty() && !value.is_empty() => {
                    Ok((key.to_string(), value.to_string()))
                }
                _ => Err(format!(
                    "directive does not match a <method>:<compiler> pattern: {}",
                    d
                )),
            })
            .collect()
    }

    /// The compiler name selected for `method_name`, if any directive matches.
    /// A `*` method pattern matches every method.
    pub fn compiler_for(&self, method_name: &str) -> Option<&str> {
        self.directives
            .iter()
            .find(|(pattern, _)| pattern == "*" || method_name.contains(pattern.as_str()))
            .map(|(_, compiler)| compiler.as_str())
    }
}

impl FromStr for CompileDirectives {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CompileDirectives::parse_directives(s).map(|directives| CompileDirectives { directives })
    }
}

fn always_valid<T>(_: &T) -> bool {
    true
}

macro_rules! options {
    ($($name:ident: $type:ty[$validator:expr] = $default:expr),*,) => [
        options!($($name: $type[$validator] = $default),*);
    ];
    ($($name:ident: $type:ty[$validator:expr] = $default:expr),*) => [
        pub struct Options {
            $(pub $name: $type),*
        }
        impl Options {
            pub fn set_from_str(&mut self, s: &str, val: &str) -> bool {
                match s {
                    // Parse the given value from str (by env vars or by calling set_from_str()) to the right type
                    $(stringify!($name) => if let Ok(ref val) = val.parse::<$type>() {
                        // Validate
                        let validate_fn = $validator;
                        let is_valid = validate_fn(val);
                        if is_valid {
                            // Only set value if valid.
                            self.$name = val.clone();
                        } else {
                            eprintln!("Warn: unable to set {}={:?}. Invalid value. Default value will be used.", s, val);
                        }
                        is_valid
                    } else {
                        eprintln!("Warn: unable to set {}={:?}. Cant parse value. Default value will be used.", s, val);
                        false
                    })*
                    _ => panic!("Invalid Options key: {}", s)
                }
            }
        }
        impl Default for Options {
            fn default() -> Self {
                let mut options = Options {
                    $($name: $default),*
                };

                // If we have env vars that start with VMPROBE_ and match any option (such as
                // VMPROBE_RECOMPILATION_THRESHOLD), we set the option to its value (if it is a
                // valid value). Otherwise, use the default value.
                const PREFIX: &str = "VMPROBE_";
                for (key, val) in std::env::vars() {
                    // strip the prefix, and get the lower case string
                    if let Some(rest_of_key) = key.strip_prefix(PREFIX) {
                        let lowercase: &str = &rest_of_key.to_lowercase();
                        match lowercase {
                            $(stringify!($name) => { options.set_from_str(lowercase, &val); },)*
                            _ => {}
                        }
                    }
                }
                options
            }
        }
    ]
}

options! {
    // Select the optimizing compiler whenever possible, instead of baseline-compiling first.
    optimize_first:           bool              [always_valid] = false,
    // The number of method entries at which a baseline-compiled method becomes a candidate for
    // recompilation by the optimizing compiler. Use 0 to disable recompilation.
    recompilation_threshold:  usize             [always_valid] = 5000,
    // Retry failed compilations with the other compiler (if one is configured).
    fail_over_compilation:    bool              [always_valid] = true,
    // Dispatch compilation requests to background worker threads instead of compiling
    // synchronously on the requesting thread.
    background_compilation:   bool              [always_valid] = false,
    // Number of background compilation worker threads.
    compile_threads:          usize             [|v: &usize| *v > 0] = num_cpus::get(),
    // Per-method compiler directives, e.g. "acme.util.Strings:opt,test.output:baseline".
    compile_directives:       CompileDirectives [always_valid] = CompileDirectives::default(),
}
