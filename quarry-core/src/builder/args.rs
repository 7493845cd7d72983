//! Positional arguments for query fragments

use super::state::QueryState;
use crate::value::Value;

/// One positional argument: a bind value or a nested query
#[derive(Debug, Clone)]
pub enum Arg {
    Value(Value),
    /// Rendered in place as a parenthesised sub-query
    Query(Box<QueryState>),
}

pub trait IntoArg {
    fn into_arg(self) -> Arg;
}

impl<T: Into<Value>> IntoArg for T {
    fn into_arg(self) -> Arg {
        Arg::Value(self.into())
    }
}

impl IntoArg for QueryState {
    fn into_arg(self) -> Arg {
        Arg::Query(Box::new(self))
    }
}

/// Argument groups accepted by fragment builders
///
/// `()` is no group, a tuple is one group of heterogeneous args, a `Vec<T>` is one
/// group of homogeneous args. To bind a whole list to a single `IN ?`
/// placeholder, wrap it in a one-element tuple: `(ids,)`.
pub trait IntoArgs {
    fn into_groups(self) -> Vec<Vec<Arg>>;
}

impl IntoArgs for () {
    fn into_groups(self) -> Vec<Vec<Arg>> {
        Vec::new()
    }
}

impl<T: IntoArg> IntoArgs for Vec<T> {
    fn into_groups(self) -> Vec<Vec<Arg>> {
        vec![self.into_iter().map(IntoArg::into_arg).collect()]
    }
}

macro_rules! impl_into_args_for_tuple {
    ($($name:ident),+) => {
        impl<$($name: IntoArg),+> IntoArgs for ($($name,)+) {
            #[allow(non_snake_case)]
            fn into_groups(self) -> Vec<Vec<Arg>> {
                let ($($name,)+) = self;
                vec![vec![$($name.into_arg()),+]]
            }
        }
    };
}

impl_into_args_for_tuple!(A);
impl_into_args_for_tuple!(A, B);
impl_into_args_for_tuple!(A, B, C);
impl_into_args_for_tuple!(A, B, C, D);
impl_into_args_for_tuple!(A, B, C, D, E);
impl_into_args_for_tuple!(A, B, C, D, E, F);
impl_into_args_for_tuple!(A, B, C, D, E, F, G);
impl_into_args_for_tuple!(A, B, C, D, E, F, G, H);

/// Several argument groups passed at once
///
/// Predicate builders accept at most one group; this exists so callers composing
/// args dynamically get a deferred `NotValid` instead of silently merged groups.
#[derive(Debug, Clone, Default)]
pub struct Args {
    groups: Vec<Vec<Arg>>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn group(mut self, args: impl IntoArgs) -> Self {
        self.groups.extend(args.into_groups());
        self
    }
}

impl IntoArgs for Args {
    fn into_groups(self) -> Vec<Vec<Arg>> {
        self.groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_shapes() {
        assert!(().into_groups().is_empty());
        assert_eq!((1, "a").into_groups().len(), 1);
        assert_eq!((1, "a").into_groups()[0].len(), 2);
        assert_eq!(vec![1, 2, 3].into_groups()[0].len(), 3);
    }

    #[test]
    fn test_list_in_tuple_is_one_arg() {
        let groups = (vec![1i64, 2],).into_groups();
        assert_eq!(groups[0].len(), 1);
        assert!(matches!(&groups[0][0], Arg::Value(Value::Array(items)) if items.len() == 2));
    }

    #[test]
    fn test_args_collects_groups() {
        let args = Args::new().group((1,)).group(("x", true));
        assert_eq!(args.into_groups().len(), 2);
    }
}
