use std::pin::Pin;

use stackful::generator::{Generator, GeneratorState, StackfulGenerator, YieldHandle};

fn main() {
    let mut generator = StackfulGenerator::new(|y: &YieldHandle<i32, i32>, mut r: i32| {
        for i in 0..100 {
            assert_eq!(r, i);
            r = y.yield_(i);
        }

        // yields the outer generator from inside a nested one
        let mut nested = StackfulGenerator::new(|_: &YieldHandle<()>, ()| {
            assert_eq!(r, 100);
            r = y.yield_(100);
        });
        assert_eq!(Pin::new(&mut nested).resume(()), GeneratorState::Complete(()));
        drop(nested);

        assert_eq!(r, 1000);
        1000
    });
    let mut generator = Pin::new(&mut generator);

    for i in 0..101 {
        println!("{:?}", generator.as_mut().resume(i));
    }
    assert_eq!(generator.as_mut().resume(1000), GeneratorState::Complete(1000));
}
